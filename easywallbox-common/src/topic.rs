use crate::error::{Error, Result};

/// Default base topic for all bridge topics.
pub const DEFAULT_BASE_TOPIC: &str = "easywallbox";

/// Builder for topics under a configured base.
///
/// Topics follow the pattern `<base>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    base: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

impl TopicBuilder {
    /// Create a builder for the given base topic.
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// The base topic.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Build a full topic from a suffix.
    ///
    /// # Example
    /// ```
    /// use easywallbox_common::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("easywallbox");
    /// assert_eq!(topics.build("set/user_limit"), "easywallbox/set/user_limit");
    /// assert_eq!(topics.build(""), "easywallbox");
    /// ```
    pub fn build(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.base, suffix)
        }
    }

    /// Strip the base from a full topic, returning the suffix.
    ///
    /// Returns `None` when the topic does not live under the base.
    ///
    /// # Example
    /// ```
    /// use easywallbox_common::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("easywallbox");
    /// assert_eq!(topics.strip("easywallbox/dpm/limit/16"), Some("dpm/limit/16"));
    /// assert_eq!(topics.strip("other/dpm"), None);
    /// ```
    pub fn strip<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.base.as_str())?;
        if rest.is_empty() {
            return Some(rest);
        }
        rest.strip_prefix('/')
    }
}

/// Build a Home Assistant discovery config topic.
///
/// # Example
/// ```
/// use easywallbox_common::discovery_topic;
///
/// assert_eq!(
///     discovery_topic("homeassistant", "number", "easywallbox", "user_limit"),
///     "homeassistant/number/easywallbox/user_limit/config"
/// );
/// ```
pub fn discovery_topic(prefix: &str, component: &str, node_id: &str, object_id: &str) -> String {
    format!("{}/{}/{}/{}/config", prefix, component, node_id, object_id)
}

/// Check that a base topic is usable for publishing and subscribing.
pub fn validate_base_topic(base: &str) -> Result<()> {
    if base.is_empty() {
        return Err(Error::Topic("base topic must not be empty".to_string()));
    }
    if base.starts_with('/') || base.ends_with('/') {
        return Err(Error::Topic(format!(
            "base topic must not start or end with '/': '{}'",
            base
        )));
    }
    if base.contains(['#', '+']) {
        return Err(Error::Topic(format!(
            "base topic must not contain wildcards: '{}'",
            base
        )));
    }
    if base.split('/').any(str::is_empty) {
        return Err(Error::Topic(format!(
            "base topic must not contain empty levels: '{}'",
            base
        )));
    }
    Ok(())
}
