//! Storage handlers implementing [`StreamSource`](crate::StreamSource) for
//! local files, HTTP and S3.

pub mod file;
pub mod http;
pub mod s3;

pub use file::FileBackend;
pub use http::HttpBackend;
pub use s3::S3Backend;

use crate::error::{Error, Result};

/// Split a `scheme://bucket/object` URI into bucket and object.
///
/// The scheme prefix is optional; leading slashes after it are stripped and
/// the first remaining slash separates bucket from object. Both parts must be
/// non-empty.
pub fn parse_bucket_object(scheme: &str, uri: &str) -> Result<(String, String)> {
    let prefix = format!("{scheme}://");
    let rest = uri.strip_prefix(&prefix).unwrap_or(uri);
    let rest = rest.trim_start_matches('/');
    let (bucket, object) = match rest.split_once('/') {
        Some((bucket, object)) => (bucket, object),
        None => (rest, ""),
    };
    if bucket.is_empty() || object.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "\"{uri}\" does not name a bucket and object"
        )));
    }
    Ok((bucket.to_string(), object.to_string()))
}
