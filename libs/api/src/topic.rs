use crate::ApiError;

/// Upper bound on a topic name, in bytes. Names map to directory names.
pub const MAX_TOPIC_NAME_LEN: usize = 255;

/// Check that `name` can be used as a topic, i.e. as a single directory
/// component under the storage root.
pub fn validate_topic_name(name: &str) -> Result<(), ApiError> {
    let reject = |reason| {
        Err(ApiError::InvalidTopicName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject("empty");
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return reject("too long");
    }
    if name == "." || name == ".." {
        return reject("reserved");
    }
    if name.contains(['/', '\\']) {
        return reject("contains a path separator");
    }
    if name.chars().any(char::is_control) {
        return reject("contains a control character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_topic_name("orders").is_ok());
        assert!(validate_topic_name("brokerTest1").is_ok());
        assert!(validate_topic_name("quotes.raw-v2").is_ok());
    }

    #[test]
    fn rejects_names_that_escape_the_root() {
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("..").is_err());
        assert!(validate_topic_name("a/b").is_err());
        assert!(validate_topic_name("a\\b").is_err());
        assert!(validate_topic_name("nul\0").is_err());
        assert!(validate_topic_name(&"x".repeat(MAX_TOPIC_NAME_LEN + 1)).is_err());
    }
}
