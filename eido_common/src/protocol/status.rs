//! Status codes carried in `statusCode`/`statusText` of every response.

use std::fmt;

/// Outcome of a protocol request, mirrored from HTTP status semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The request was accepted.
    Ok,
    /// The request could not be parsed.
    BadRequest,
    /// A subscribe referenced an unknown subscription id.
    NotFound,
    /// An unsubscribe or terminate referenced an unknown subscription id.
    SubscriptionDoesNotExist,
}

impl StatusCode {
    /// Numeric code placed in `statusCode`.
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::SubscriptionDoesNotExist => 481,
        }
    }

    /// Human-readable text placed in `statusText`.
    pub fn text(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::SubscriptionDoesNotExist => "Subscription Does Not Exist",
        }
    }

    /// Maps a numeric code back to a known status.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(StatusCode::Ok),
            400 => Some(StatusCode::BadRequest),
            404 => Some(StatusCode::NotFound),
            481 => Some(StatusCode::SubscriptionDoesNotExist),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_both_ways() {
        for status in [
            StatusCode::Ok,
            StatusCode::BadRequest,
            StatusCode::NotFound,
            StatusCode::SubscriptionDoesNotExist,
        ] {
            assert_eq!(StatusCode::from_code(status.code()), Some(status));
        }
        assert_eq!(StatusCode::from_code(500), None);
        assert_eq!(StatusCode::Ok.to_string(), "200 OK");
    }
}
