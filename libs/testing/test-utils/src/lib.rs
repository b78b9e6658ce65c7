//! Shared test utilities for NATS function testing
//!
//! This crate provides reusable test infrastructure:
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: Deterministic stream/function names so tests sharing
//!   a server never collide (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `nats` (default): Enables the NATS container helper
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestDataBuilder::from_test_name("my_nats_test");
//!
//!     let input = names.stream("requests");
//!     let function = names.function("checker");
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for test names with deterministic randomization
///
/// This keeps tests reproducible while giving every test its own streams
/// and durable consumers.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_rebind_after_restart");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a stream name that is also a valid subject
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let name = TestDataBuilder::new(7).stream("requests");
    /// assert_eq!(name, "TEST_REQUESTS_7");
    /// ```
    pub fn stream(&self, role: &str) -> String {
        let role: String = role
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("TEST_{}_{}", role, self.seed)
    }

    /// Generate a function (durable consumer) name
    pub fn function(&self, suffix: &str) -> String {
        format!("test-fn-{}-{}", self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that `actual` contains exactly the items of `expected`, in any order
    pub fn assert_same_items(actual: &[String], expected: &[&str], context: &str) {
        let mut actual: Vec<&str> = actual.iter().map(String::as_str).collect();
        let mut expected = expected.to_vec();
        actual.sort_unstable();
        expected.sort_unstable();
        assert_eq!(actual, expected, "{}: item sets differ", context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.stream("in"), builder2.stream("in"));
        assert_eq!(builder1.function("main"), builder2.function("main"));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        // Different test names should generate different streams
        assert_ne!(builder1.stream("in"), builder2.stream("in"));
    }

    #[test]
    fn test_stream_names_have_no_subject_separators() {
        let name = TestDataBuilder::new(1).stream("rule.requests v2");
        assert_eq!(name, "TEST_RULE_REQUESTS_V2_1");
    }

    #[test]
    fn test_assert_same_items() {
        let actual = vec!["b".to_string(), "a".to_string()];
        assertions::assert_same_items(&actual, &["a", "b"], "subjects");
    }
}
