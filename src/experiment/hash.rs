//! Bucketing hash.
//!
//! Deliberately non-cryptographic. For each UTF-16 code unit `c` of the input,
//! `h = (h << 5) - h + c` in wrapping signed 32-bit arithmetic, starting from
//! 0 (equivalently `h = h * 31 + c`). The bucket is `|h| % 100`, with `|h|`
//! taken in 64 bits so `i32::MIN` maps to 2147483648. Existing assignments
//! from other implementations of the same function stay valid.

pub fn rolling_hash(input: &str) -> i32 {
    let mut h: i32 = 0;
    for unit in input.encode_utf16() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(unit as i32);
    }
    h
}

/// Bucket in `0..100`.
pub fn bucket(input: &str) -> u32 {
    ((rolling_hash(input) as i64).unsigned_abs() % 100) as u32
}

pub fn allocation_bucket(user_id: &str, experiment_id: &str) -> u32 {
    bucket(&format!("{}{}_allocation", user_id, experiment_id))
}

pub fn variant_bucket(user_id: &str, experiment_id: &str) -> u32 {
    bucket(&format!("{}{}", user_id, experiment_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(rolling_hash(""), 0);
        assert_eq!(rolling_hash("a"), 97);
        assert_eq!(rolling_hash("hello"), 99162322);
        assert_eq!(rolling_hash("Hello World"), -862545276);
        assert_eq!(bucket("hello"), 22);
        assert_eq!(bucket("Hello World"), 76);
    }

    #[test]
    fn test_bucket_inputs() {
        assert_eq!(rolling_hash("user-42pricing_layout_allocation"), -1125917412);
        assert_eq!(allocation_bucket("user-42", "pricing_layout"), 12);
        assert_eq!(variant_bucket("user-42", "pricing_layout"), 81);
    }

    #[test]
    fn test_bucket_range() {
        for i in 0..1000 {
            assert!(bucket(&format!("visitor-{}", i)) < 100);
        }
    }
}
