use crate::model::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Filesystem,
    AWS,
    GCS,
    Memory,
}

impl Provider {
    pub fn is_filesystem(&self) -> bool {
        matches!(self, Provider::Filesystem)
    }

    pub fn is_aws(&self) -> bool {
        matches!(self, Provider::AWS)
    }

    pub fn is_gcs(&self) -> bool {
        matches!(self, Provider::GCS)
    }
}

pub fn parse_provider_from_uri(bucket_uri: &str) -> Result<Provider, Error> {
    match bucket_uri.split_once("://").map(|(scheme, _)| scheme) {
        Some("file") => Ok(Provider::Filesystem),
        Some("s3") => Ok(Provider::AWS),
        Some("gs") => Ok(Provider::GCS),
        Some("mem") => Ok(Provider::Memory),
        _ => Err(Error::backend(format!(
            "failed to parse provider of: {}",
            bucket_uri
        ))),
    }
}

/// Bucket name for cloud URIs, root directory for `file://` URIs.
pub fn parse_bucket_from_uri(bucket_uri: &str) -> &str {
    let rest = bucket_uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or("");

    if bucket_uri.starts_with("file://") {
        rest
    } else {
        rest.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider() {
        assert!(matches!(parse_provider_from_uri("s3://bucket"), Ok(Provider::AWS)));
        assert!(matches!(parse_provider_from_uri("gs://bucket"), Ok(Provider::GCS)));
        assert!(matches!(
            parse_provider_from_uri("file:///var/data"),
            Ok(Provider::Filesystem)
        ));
        assert!(matches!(parse_provider_from_uri("mem://"), Ok(Provider::Memory)));
        assert!(matches!(parse_provider_from_uri("ftp://bucket"), Err(_)));
        assert!(matches!(parse_provider_from_uri("bucket"), Err(_)));
    }

    #[test]
    fn test_provider_predicates() {
        assert!(Provider::Filesystem.is_filesystem());
        assert!(Provider::AWS.is_aws());
        assert!(Provider::GCS.is_gcs());
        assert!(!Provider::Memory.is_filesystem());
        assert!(!Provider::GCS.is_aws());
    }

    #[test]
    fn test_parse_bucket() {
        let cases = vec![
            ("s3://bucket", "bucket"),
            ("gs://bucket/", "bucket"),
            ("file:///var/data", "/var/data"),
            ("file://relative/dir", "relative/dir"),
            ("mem://", ""),
            ("bucket", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_bucket_from_uri(input), expected, "failed for case: {}", input);
        }
    }
}
