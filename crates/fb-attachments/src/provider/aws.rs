//! AWS S3 provider backed by `aws-sdk-s3`
//!
//! Buckets are created on demand with a canned ACL matching the requested
//! visibility, and every object is written with `public-read` or `private`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials as SdkCredentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::operation::create_bucket::builders::CreateBucketFluentBuilder;
use aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketCannedAcl, BucketLocationConstraint, CreateBucketConfiguration, ObjectCannedAcl,
    StorageClass,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use super::{
    validate_key, Connection, Directory, NewObject, ObjectMeta, ProviderError, ProviderResult,
};
use crate::credentials::Credentials;

const DEFAULT_REGION: &str = "us-east-1";
const PROVIDER: &str = "AWS";

/// Bucket names that can be used as a virtual host over https
static DNS_COMPATIBLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-]{1,61}[a-z0-9]$").unwrap());

/// Settings read from the `aws_*`, `region`, `endpoint` and `path_style`
/// credential keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub path_style: bool,
}

impl AwsSettings {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let owned = |key: &str| credentials.get_str(key).map(str::to_string);

        Self {
            access_key_id: owned("aws_access_key_id"),
            secret_access_key: owned("aws_secret_access_key"),
            session_token: owned("aws_session_token"),
            region: owned("region").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            endpoint: owned("endpoint"),
            path_style: credentials.get_bool("path_style").unwrap_or(false),
        }
    }

    /// Build the S3 client. Without an explicit key pair the default AWS
    /// credential chain (environment, profile, instance role) is used.
    async fn client(&self) -> Client {
        let mut builder = match (&self.access_key_id, &self.secret_access_key) {
            (Some(key), Some(secret)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(SdkCredentials::new(
                    key,
                    secret,
                    self.session_token.clone(),
                    None,
                    "fogbox",
                )),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder
            .region(Region::new(self.region.clone()))
            .force_path_style(self.path_style || self.endpoint.is_some());
        if let Some(ref endpoint) = self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Client::from_conf(builder.build())
    }

    /// Base URL under which objects of `bucket` are publicly reachable
    fn public_base(&self, bucket: &str) -> String {
        if let Some(ref endpoint) = self.endpoint {
            format!("{}/{}", endpoint.trim_end_matches('/'), bucket)
        } else if !self.path_style && DNS_COMPATIBLE.is_match(bucket) {
            format!("https://{}.s3.{}.amazonaws.com", bucket, self.region)
        } else {
            format!("https://s3.{}.amazonaws.com/{}", self.region, bucket)
        }
    }
}

/// Connection to S3 or an S3-compatible service
#[derive(Debug, Clone)]
pub struct AwsConnection {
    settings: AwsSettings,
    client: Client,
}

impl AwsConnection {
    pub async fn connect(credentials: &Credentials) -> ProviderResult<Self> {
        let settings = AwsSettings::from_credentials(credentials);
        let client = settings.client().await;

        info!(region = %settings.region, endpoint = ?settings.endpoint, "S3 connection configured");
        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &AwsSettings {
        &self.settings
    }

    fn create_bucket_request(&self, name: &str, public: bool) -> CreateBucketFluentBuilder {
        let mut request = self
            .client
            .create_bucket()
            .bucket(name)
            .acl(bucket_acl(public));

        // us-east-1 rejects an explicit location constraint
        if self.settings.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(
                        self.settings.region.as_str(),
                    ))
                    .build(),
            );
        }
        request
    }
}

#[async_trait]
impl Connection for AwsConnection {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn directory(&self, name: &str) -> ProviderResult<Arc<dyn Directory>> {
        Ok(Arc::new(AwsDirectory {
            name: name.to_string(),
            client: self.client.clone(),
            public_base: self.settings.public_base(name),
        }))
    }

    async fn create_directory(&self, name: &str, public: bool) -> ProviderResult<()> {
        match self.create_bucket_request(name, public).send().await {
            Ok(_) => {
                info!(bucket = %name, public, "Bucket created");
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                debug!(bucket = %name, "Bucket already exists");
                Ok(())
            }
            Err(err) => Err(ProviderError::Backend(format!(
                "S3 create bucket {name}: {}",
                DisplayErrorContext(&err)
            ))),
        }
    }
}

/// A bucket
#[derive(Debug)]
pub struct AwsDirectory {
    name: String,
    client: Client,
    public_base: String,
}

fn object_acl(public: bool) -> ObjectCannedAcl {
    if public {
        ObjectCannedAcl::PublicRead
    } else {
        ObjectCannedAcl::Private
    }
}

fn bucket_acl(public: bool) -> BucketCannedAcl {
    if public {
        BucketCannedAcl::PublicRead
    } else {
        BucketCannedAcl::Private
    }
}

fn option_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_utc(time: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

impl AwsDirectory {
    /// The put request for an object.
    ///
    /// Known header options map to their request field; anything else is
    /// stored as user metadata.
    fn put_request(&self, object: &NewObject) -> PutObjectFluentBuilder {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.name)
            .key(&object.key)
            .body(ByteStream::from(object.body.clone()))
            .content_type(&object.content_type)
            .acl(object_acl(object.public));

        for (name, value) in &object.options {
            let value = option_value(value);
            request = match name.as_str() {
                "cache_control" | "Cache-Control" => request.cache_control(value),
                "content_disposition" | "Content-Disposition" => request.content_disposition(value),
                "content_encoding" | "Content-Encoding" => request.content_encoding(value),
                "content_language" | "Content-Language" => request.content_language(value),
                "content_type" | "Content-Type" => request.content_type(value),
                "storage_class" => request.storage_class(StorageClass::from(value.as_str())),
                other => request.metadata(other, value),
            };
        }

        request
    }
}

#[async_trait]
impl Directory for AwsDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self, key: &str) -> ProviderResult<Option<ObjectMeta>> {
        validate_key(key)?;
        match self.client.head_object().bucket(&self.name).key(key).send().await {
            Ok(output) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                content_type: output.content_type().map(str::to_string),
                last_modified: output.last_modified().and_then(to_utc),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(ProviderError::Backend(format!(
                "S3 head {key}: {}",
                DisplayErrorContext(&err)
            ))),
        }
    }

    async fn create(&self, object: &NewObject) -> ProviderResult<()> {
        validate_key(&object.key)?;
        match self.put_request(object).send().await {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("NoSuchBucket") => {
                Err(ProviderError::DirectoryNotFound(self.name.clone()))
            }
            Err(err) => Err(ProviderError::Backend(format!(
                "S3 put {}: {}",
                object.key,
                DisplayErrorContext(&err)
            ))),
        }
    }

    async fn get(&self, key: &str) -> ProviderResult<Bytes> {
        validate_key(key)?;
        let output = match self.client.get_object().bucket(&self.name).key(key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(ProviderError::NotFound(key.to_string()));
            }
            Err(err) => {
                return Err(ProviderError::Backend(format!(
                    "S3 get {key}: {}",
                    DisplayErrorContext(&err)
                )));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ProviderError::Backend(format!("S3 get {key}: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn destroy(&self, key: &str) -> ProviderResult<()> {
        validate_key(key)?;
        match self.client.delete_object().bucket(&self.name).key(key).send().await {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("NoSuchKey") => Ok(()),
            Err(err) => Err(ProviderError::Backend(format!(
                "S3 delete {key}: {}",
                DisplayErrorContext(&err)
            ))),
        }
    }

    fn public_url(&self, key: &str) -> ProviderResult<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.public_base, key))
    }

    async fn expiring_url(&self, key: &str, expires_at: DateTime<Utc>) -> ProviderResult<String> {
        validate_key(key)?;
        let expires_in = (expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ProviderError::Backend(format!("S3 presign {key}: {e}")))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.name)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| ProviderError::Backend(format!("S3 presign {key}: {}", DisplayErrorContext(&e))))?;

        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn credentials(value: serde_json::Value) -> Credentials {
        Credentials::from_map(value.as_object().unwrap().clone())
    }

    fn creds() -> serde_json::Value {
        json!({
            "provider": "AWS",
            "aws_access_key_id": "AKIAEXAMPLE",
            "aws_secret_access_key": "secret",
            "region": "eu-west-1",
        })
    }

    async fn connection(value: serde_json::Value) -> AwsConnection {
        AwsConnection::connect(&credentials(value)).await.unwrap()
    }

    fn new_object(public: bool, options: BTreeMap<String, serde_json::Value>) -> NewObject {
        NewObject {
            key: "avatars/1/original/me.png".to_string(),
            body: Bytes::from_static(b"png"),
            content_type: "image/png".to_string(),
            public,
            options,
        }
    }

    fn aws_directory(connection: &AwsConnection, name: &str) -> AwsDirectory {
        AwsDirectory {
            name: name.to_string(),
            client: connection.client.clone(),
            public_base: connection.settings.public_base(name),
        }
    }

    #[tokio::test]
    async fn test_public_url_virtual_host() {
        let dir = connection(creds()).await.directory("my-bucket").unwrap();
        assert_eq!(
            dir.public_url("avatars/1/original/me.png").unwrap(),
            "https://my-bucket.s3.eu-west-1.amazonaws.com/avatars/1/original/me.png"
        );
    }

    #[tokio::test]
    async fn test_public_url_path_style_for_dotted_bucket() {
        let dir = connection(creds()).await.directory("assets.example.com").unwrap();
        assert_eq!(
            dir.public_url("a.png").unwrap(),
            "https://s3.eu-west-1.amazonaws.com/assets.example.com/a.png"
        );
    }

    #[tokio::test]
    async fn test_public_url_custom_endpoint() {
        let mut value = creds();
        value["endpoint"] = json!("http://localhost:9000/");
        let dir = connection(value).await.directory("uploads").unwrap();

        assert_eq!(
            dir.public_url("a.png").unwrap(),
            "http://localhost:9000/uploads/a.png"
        );
    }

    #[test]
    fn test_default_region() {
        let settings = AwsSettings::from_credentials(&credentials(json!({ "provider": "AWS" })));
        assert_eq!(settings.region, "us-east-1");
        assert!(settings.access_key_id.is_none());
        assert!(!settings.path_style);
    }

    #[tokio::test]
    async fn test_put_request_carries_visibility() {
        let conn = connection(creds()).await;
        let dir = aws_directory(&conn, "my-bucket");

        let private = dir.put_request(&new_object(false, BTreeMap::new()));
        let public = dir.put_request(&new_object(true, BTreeMap::new()));

        assert_eq!(private.get_acl(), &Some(ObjectCannedAcl::Private));
        assert_eq!(public.get_acl(), &Some(ObjectCannedAcl::PublicRead));
        assert_eq!(private.get_bucket().as_deref(), Some("my-bucket"));
        assert_eq!(private.get_content_type().as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_put_request_maps_options() {
        let conn = connection(creds()).await;
        let dir = aws_directory(&conn, "my-bucket");
        let mut options = BTreeMap::new();
        options.insert("cache_control".to_string(), json!("max-age=60"));
        options.insert("storage_class".to_string(), json!("STANDARD_IA"));
        options.insert("owner".to_string(), json!(42));

        let request = dir.put_request(&new_object(true, options));

        assert_eq!(request.get_cache_control().as_deref(), Some("max-age=60"));
        assert_eq!(request.get_storage_class(), &Some(StorageClass::StandardIa));
        assert_eq!(
            request
                .get_metadata()
                .as_ref()
                .and_then(|metadata| metadata.get("owner"))
                .map(String::as_str),
            Some("42")
        );
    }

    #[tokio::test]
    async fn test_create_bucket_request() {
        let conn = connection(creds()).await;

        let request = conn.create_bucket_request("uploads", false);
        assert_eq!(request.get_bucket().as_deref(), Some("uploads"));
        assert_eq!(request.get_acl(), &Some(BucketCannedAcl::Private));
        assert_eq!(
            request
                .get_create_bucket_configuration()
                .as_ref()
                .and_then(|config| config.location_constraint()),
            Some(&BucketLocationConstraint::EuWest1)
        );

        let public = conn.create_bucket_request("uploads", true);
        assert_eq!(public.get_acl(), &Some(BucketCannedAcl::PublicRead));
    }

    #[tokio::test]
    async fn test_create_bucket_request_in_default_region() {
        let mut value = creds();
        value["region"] = json!("us-east-1");
        let conn = connection(value).await;

        let request = conn.create_bucket_request("uploads", true);
        assert!(request.get_create_bucket_configuration().is_none());
    }

    #[tokio::test]
    async fn test_expiring_url_is_presigned() {
        let dir = connection(creds()).await.directory("my-bucket").unwrap();
        let url = dir
            .expiring_url("a.png", Utc::now() + chrono::Duration::seconds(600))
            .await
            .unwrap();

        assert!(url.starts_with("https://"));
        assert!(url.contains("a.png"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires="));
    }
}
