/// Broker configuration.
///
/// Loaded from line-oriented `key value` text: one entry per line, `#`
/// starts a comment, unknown keys are ignored with a warning.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// `None` when the `websocket_port` entry is absent or `disabled`.
    pub websocket_port: Option<u16>,
    pub password_file: Option<String>,
    pub allow_anonymous: bool,
    pub allow_zero_byte_client_id: bool,
    /// Wire limit for a single inbound packet.
    pub max_packet_size: usize,
    /// Per-connection outbound channel capacity; a full channel is the
    /// "not writable" signal that diverts deliveries to the session queue.
    pub outbound_queue: usize,
    pub flush_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1883,
            websocket_port: None,
            password_file: None,
            allow_anonymous: true,
            allow_zero_byte_client_id: false,
            max_packet_size: 268_435_455,
            outbound_queue: 128,
            flush_interval_ms: 500,
        }
    }
}

impl BrokerConfig {
    pub fn parse(text: &str) -> BrokerConfig {
        let mut config = BrokerConfig::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = match line.split_once_whitespace() {
                Some(pair) => pair,
                None => {
                    tracing::warn!(line = %line, "config entry without a value");
                    continue;
                }
            };

            match key {
                "host" => config.host = value.to_string(),
                "port" => parse_into(key, value, &mut config.port),
                "websocket_port" => {
                    if value == "disabled" {
                        config.websocket_port = None;
                    } else {
                        let mut port = 0;
                        parse_into(key, value, &mut port);
                        if port != 0 {
                            config.websocket_port = Some(port);
                        }
                    }
                }
                "password_file" => config.password_file = Some(value.to_string()),
                "allow_anonymous" => parse_into(key, value, &mut config.allow_anonymous),
                "allow_zero_byte_client_id" => {
                    parse_into(key, value, &mut config.allow_zero_byte_client_id)
                }
                "max_packet_size" => parse_into(key, value, &mut config.max_packet_size),
                "outbound_queue" => parse_into(key, value, &mut config.outbound_queue),
                "flush_interval_ms" => parse_into(key, value, &mut config.flush_interval_ms),
                _ => tracing::warn!(key = %key, "unknown config key"),
            }
        }

        config
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key = %key, value = %value, "invalid config value"),
    }
}

trait SplitOnceWhitespace {
    fn split_once_whitespace(&self) -> Option<(&str, &str)>;
}

impl SplitOnceWhitespace for str {
    fn split_once_whitespace(&self) -> Option<(&str, &str)> {
        let idx = self.find(char::is_whitespace)?;
        let value = self[idx..].trim_start();
        if value.is_empty() {
            return None;
        }
        Some((&self[..idx], value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let config = BrokerConfig::parse(
            r#"
            # broker listeners
            port 2883
            host 127.0.0.1
            websocket_port 8080

            password_file /etc/velour/passwd
            allow_anonymous false
            allow_zero_byte_client_id true
            "#,
        );
        assert_eq!(config.port, 2883);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.websocket_port, Some(8080));
        assert_eq!(config.password_file.as_deref(), Some("/etc/velour/passwd"));
        assert!(!config.allow_anonymous);
        assert!(config.allow_zero_byte_client_id);
    }

    #[test]
    fn test_parse_defaults() {
        let config = BrokerConfig::parse("");
        assert_eq!(config.port, 1883);
        assert_eq!(config.websocket_port, None);
        assert!(config.allow_anonymous);
        assert!(!config.allow_zero_byte_client_id);
    }

    #[test]
    fn test_parse_ignores_unknown_and_invalid() {
        let config = BrokerConfig::parse(
            r#"
            persistence_store /tmp/store
            port not-a-number
            websocket_port disabled
            "#,
        );
        assert_eq!(config.port, 1883);
        assert_eq!(config.websocket_port, None);
    }
}
