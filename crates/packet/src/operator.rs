//! Route identifiers and the reserved operator range.

/// Heartbeat operator, answered by the ping handler or an empty success.
pub const OPERATOR_HEARTBEAT: u32 = 0;

/// Turns the calling connection into a subscriber of the topic in the body.
pub const OPERATOR_REGISTER_LISTENER: u32 = 1;

/// Removes the subscription for the topic in the body.
pub const OPERATOR_REMOVE_LISTENER: u32 = 2;

/// Every user route must hash to a value at or above this bound.
pub const OPERATOR_MAX: u32 = 1024;

/// Computes the operator for a route name (CRC32, IEEE polynomial).
#[must_use]
pub fn operator(route: &str) -> u32 {
    crc32fast::hash(route.as_bytes())
}

/// Returns `true` if the operator lies in the range kept for internal routes.
#[must_use]
pub const fn is_reserved(operator: u32) -> bool {
    operator < OPERATOR_MAX
}

/// Key used to match a response to the request that produced it.
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn correlation_key(operator: u32, sequence: i64) -> i64 {
    (operator as i64).wrapping_add(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_is_crc32() {
        assert_eq!(operator("/v1/healthy"), 2_121_267_679);
        assert_eq!(operator(""), 0);
    }

    #[test]
    fn test_reserved_range() {
        assert!(is_reserved(OPERATOR_HEARTBEAT));
        assert!(is_reserved(OPERATOR_REMOVE_LISTENER));
        assert!(is_reserved(operator("/reserved/18472297")));
        assert!(!is_reserved(OPERATOR_MAX));
        assert!(!is_reserved(operator("/v1/healthy")));
    }

    #[test]
    fn test_correlation_key() {
        assert_eq!(correlation_key(7, 100), 107);
        assert_eq!(correlation_key(u32::MAX, i64::MAX), i64::MIN + i64::from(u32::MAX) - 1);
        // Listener keys carry no sequence.
        let topic = operator("news");
        assert_eq!(correlation_key(topic, 0), i64::from(topic));
    }
}
