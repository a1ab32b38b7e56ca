//! Path and URL template interpolation
//!
//! Templates contain `:token` placeholders. Unknown tokens are left in place
//! so a later pass (or the caller's resolver) can fill them in.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::model::{FileInfo, RecordRef};

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r":([a-z]+(?:_[a-z]+)*)").unwrap());

/// Values available to a template
#[derive(Debug, Clone, Copy)]
pub struct InterpolationContext<'a> {
    pub record: &'a RecordRef,
    pub attachment: &'a str,
    pub file: &'a FileInfo,
    pub style: &'a str,
}

impl<'a> InterpolationContext<'a> {
    fn value(&self, token: &str) -> Option<String> {
        let value = match token {
            "class" => self.record.class_name.clone(),
            "attachment" => self.attachment.to_string(),
            "id" => self.record.id.map(|id| id.to_string()).unwrap_or_default(),
            "id_partition" => self.record.id.map(id_partition).unwrap_or_default(),
            "style" => self.style.to_string(),
            "filename" => self.file.filename.clone(),
            "basename" => basename(&self.file.filename),
            "extension" => extension(&self.file.filename),
            "updated_at" => self.file.updated_at.timestamp().to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Interpolate the built-in tokens
pub fn interpolate(template: &str, ctx: &InterpolationContext<'_>) -> String {
    interpolate_with(template, ctx, |_| None)
}

/// Interpolate built-in tokens, then ask `extra` for anything else
pub fn interpolate_with<F>(template: &str, ctx: &InterpolationContext<'_>, extra: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            let token = &caps[1];
            ctx.value(token)
                .or_else(|| extra(token))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// `123` → `000/000/123`
pub fn id_partition(id: i64) -> String {
    let padded = format!("{:09}", id);
    if padded.len() > 9 {
        return padded;
    }
    format!("{}/{}/{}", &padded[0..3], &padded[3..6], &padded[6..9])
}

fn basename(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_string()
}

fn extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string()
}
