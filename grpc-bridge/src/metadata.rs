//! Translation between host header blocks and engine [`Metadata`].

use bytes::Bytes;
use grpc_bridge_core::{Metadata, MetadataValue, Status, is_binary_key};
use http::StatusCode;
use http::header::{CONTENT_TYPE, TE, USER_AGENT};

use crate::host::HeaderList;

/// Content type served by the bridge; `application/grpc+proto` etc. share the prefix.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

pub const GRPC_STATUS_HEADER: &str = "grpc-status";
pub const GRPC_MESSAGE_HEADER: &str = "grpc-message";

/// Pseudo-header carrying the HTTP status of a response.
pub const STATUS_PSEUDO_HEADER: &str = ":status";

/// Convert an inbound header block into engine metadata.
///
/// Pseudo-headers are not metadata and are skipped, as are names that are not
/// valid metadata keys. Values of `-bin` headers are taken as raw bytes.
pub fn metadata_from_headers(headers: &HeaderList) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers.iter() {
        if name.starts_with(':') {
            continue;
        }
        let appended = if is_binary_key(name) {
            metadata.append_binary(name, value.clone())
        } else {
            metadata.append_ascii(name, String::from_utf8_lossy(value).into_owned())
        };
        if let Err(e) = appended {
            tracing::debug!(header = name, error = %e, "invalid header name, metadata dropped");
        }
    }
    metadata
}

/// Build the response header block for `metadata`.
///
/// Keys the bridge sets itself (`content-type`, `te`, `user-agent`) are
/// discarded from `metadata` first.
pub fn response_headers(mut metadata: Metadata) -> HeaderList {
    for reserved in [CONTENT_TYPE.as_str(), TE.as_str(), USER_AGENT.as_str()] {
        metadata.remove_all(reserved);
    }

    let mut headers = HeaderList::new()
        .with(STATUS_PSEUDO_HEADER, StatusCode::OK.as_str().to_owned())
        .with(CONTENT_TYPE.as_str(), GRPC_CONTENT_TYPE);
    append_metadata(&mut headers, metadata);
    headers
}

/// Build the trailer block, or `None` when there are no trailers to send.
///
/// `grpc-status` and `grpc-message` are filled in from `status` when the
/// trailers do not already carry them.
pub fn response_trailers(trailers: Option<Metadata>, status: &Status) -> Option<HeaderList> {
    let trailers = trailers?;
    let has_status = trailers.contains_key(GRPC_STATUS_HEADER);

    let mut headers = HeaderList::new();
    append_metadata(&mut headers, trailers);
    if !has_status {
        headers.push(GRPC_STATUS_HEADER, status.code().value().to_string());
        if let Some(message) = status.message() {
            headers.push(GRPC_MESSAGE_HEADER, percent_encode(message));
        }
    }
    Some(headers)
}

/// Turn a trailer block into a trailers-only response, for calls that end
/// before any header block was written.
pub fn trailers_only(trailers: HeaderList) -> HeaderList {
    let mut headers = HeaderList::new()
        .with(STATUS_PSEUDO_HEADER, StatusCode::OK.as_str().to_owned())
        .with(CONTENT_TYPE.as_str(), GRPC_CONTENT_TYPE);
    for (name, value) in trailers.iter() {
        headers.push(name, value.clone());
    }
    headers
}

fn append_metadata(headers: &mut HeaderList, metadata: Metadata) {
    for (key, value) in metadata {
        let value = match value {
            MetadataValue::Ascii(s) => Bytes::from(s),
            MetadataValue::Binary(b) => b,
        };
        headers.push(key, value);
    }
}

/// Percent-encode a status message for `grpc-message`.
///
/// Printable ASCII except `%` passes through; everything else is `%XX` of its UTF-8 bytes.
pub fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use grpc_bridge_core::Code;

    #[test]
    fn test_binary_and_ascii_headers() {
        let headers = HeaderList::new()
            .with("trace-bin", vec![0x01, 0x02])
            .with("trace", "abc");

        let metadata = metadata_from_headers(&headers);
        assert_eq!(metadata.len(), 2);
        assert_eq!(
            metadata.get("trace-bin"),
            Some(&MetadataValue::Binary(Bytes::from_static(&[0x01, 0x02])))
        );
        assert_eq!(
            metadata.get("trace"),
            Some(&MetadataValue::Ascii("abc".to_string()))
        );
    }

    #[test]
    fn test_inbound_skips_pseudo_headers_and_keeps_order() {
        let headers = HeaderList::new()
            .with(":path", "/pkg.Svc/Call")
            .with("x-b", "1")
            .with("x-a", "2")
            .with("x-b", "3");

        let metadata = metadata_from_headers(&headers);
        let pairs: Vec<_> = metadata
            .iter()
            .map(|(k, v)| (k, v.as_str().unwrap()))
            .collect();
        assert_eq!(pairs, [("x-b", "1"), ("x-a", "2"), ("x-b", "3")]);
    }

    #[test]
    fn test_response_headers_strip_reserved_keys() {
        let mut metadata = Metadata::new();
        metadata.append_ascii("content-type", "text/plain").unwrap();
        metadata.append_ascii("user-agent", "engine/1.0").unwrap();
        metadata.append_ascii("te", "trailers").unwrap();
        metadata.append_ascii("x-served-by", "node-1").unwrap();

        let headers = response_headers(metadata);
        let names: Vec<_> = headers.names().collect();
        assert_eq!(names, [":status", "content-type", "x-served-by"]);
        assert_eq!(headers.get_str(":status"), Some("200"));
        assert_eq!(headers.get_str("content-type"), Some(GRPC_CONTENT_TYPE));
    }

    #[test]
    fn test_absent_trailers_write_nothing() {
        assert!(response_trailers(None, &Status::ok()).is_none());
    }

    #[test]
    fn test_trailers_completed_from_status() {
        let mut trailers = Metadata::new();
        trailers.append_binary("detail-bin", vec![9u8]).unwrap();

        let status = Status::new(Code::NotFound, "no such order 100%");
        let headers = response_trailers(Some(trailers), &status).unwrap();
        assert_eq!(headers.get("detail-bin").map(|v| &v[..]), Some(&[9u8][..]));
        assert_eq!(headers.get_str(GRPC_STATUS_HEADER), Some("5"));
        assert_eq!(headers.get_str(GRPC_MESSAGE_HEADER), Some("no such order 100%25"));
    }

    #[test]
    fn test_trailers_keep_engine_status() {
        let mut trailers = Metadata::new();
        trailers.append_ascii(GRPC_STATUS_HEADER, "0").unwrap();

        let headers = response_trailers(Some(trailers), &Status::internal("ignored")).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_str(GRPC_STATUS_HEADER), Some("0"));
    }

    #[test]
    fn test_trailers_only_carries_status_pseudo_header() {
        let trailers = response_trailers(Some(Metadata::new()), &Status::unimplemented("nope")).unwrap();
        let headers = trailers_only(trailers);
        let names: Vec<_> = headers.names().collect();
        assert_eq!(names, [":status", "content-type", "grpc-status", "grpc-message"]);
        assert_eq!(headers.get_str(GRPC_STATUS_HEADER), Some("12"));
    }

    #[test]
    fn test_percent_encode_non_ascii() {
        assert_eq!(percent_encode("plain"), "plain");
        assert_eq!(percent_encode("é"), "%C3%A9");
        assert_eq!(percent_encode("a\nb"), "a%0Ab");
    }
}
