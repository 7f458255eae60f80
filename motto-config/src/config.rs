// Settings loading and management

use std::path::Path;

use crate::schema::{MottoSettings, SettingsError};

/// Load settings from the default file location and environment.
///
/// Loading hierarchy: env > file > defaults. The file path is taken from
/// `MOTTO_CONFIG` when set, otherwise `./motto.toml`; a missing file is
/// not an error.
pub fn load_settings() -> Result<MottoSettings, SettingsError> {
    let path = std::env::var("MOTTO_CONFIG").unwrap_or_else(|_| "motto.toml".to_string());
    let path = Path::new(&path);

    let mut settings = if path.exists() {
        load_from_path(path)?
    } else {
        MottoSettings::default()
    };

    apply_env_overrides(&mut settings)?;
    validate_settings(&settings)?;

    Ok(settings)
}

/// Load settings from a specific file.
pub fn load_from_path(path: &Path) -> Result<MottoSettings, SettingsError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| SettingsError::Parse(e.to_string()))
}

/// Apply `MOTTO_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut MottoSettings) -> Result<(), SettingsError> {
    if let Ok(value) = std::env::var("MOTTO_ENGINE_POOL_SIZE") {
        settings.engine.sequence_pool_size = parse_env("MOTTO_ENGINE_POOL_SIZE", &value)?;
    }
    if let Ok(value) = std::env::var("MOTTO_ENGINE_MAX_DEPTH") {
        settings.engine.max_nested_depth = parse_env("MOTTO_ENGINE_MAX_DEPTH", &value)?;
    }
    if let Ok(value) = std::env::var("MOTTO_EVENTS_QUEUE_CAPACITY") {
        settings.events.handler_queue_capacity =
            parse_env("MOTTO_EVENTS_QUEUE_CAPACITY", &value)?;
    }
    if let Ok(value) = std::env::var("MOTTO_IDEMPOTENCY_TTL_MS") {
        settings.idempotency.ttl_ms = parse_env("MOTTO_IDEMPOTENCY_TTL_MS", &value)?;
    }
    if let Ok(value) = std::env::var("MOTTO_TRANSPORT_PORT") {
        settings.transport.port = value;
    }
    if let Ok(value) = std::env::var("MOTTO_TRANSPORT_BAUD") {
        settings.transport.baud = parse_env("MOTTO_TRANSPORT_BAUD", &value)?;
    }
    if let Ok(value) = std::env::var("MOTTO_LOADER_STRICT") {
        settings.loader.strict = parse_env("MOTTO_LOADER_STRICT", &value)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value
        .parse()
        .map_err(|_| SettingsError::Validation(format!("invalid {}: {}", key, value)))
}

/// Validate settings ranges.
pub fn validate_settings(settings: &MottoSettings) -> Result<(), SettingsError> {
    if settings.engine.max_nested_depth == 0 {
        return Err(SettingsError::Validation(
            "engine.max_nested_depth must be >= 1".to_string(),
        ));
    }
    if settings.events.handler_queue_capacity == 0 {
        return Err(SettingsError::Validation(
            "events.handler_queue_capacity must be >= 1".to_string(),
        ));
    }
    if settings.idempotency.ttl_ms == 0 {
        return Err(SettingsError::Validation(
            "idempotency.ttl_ms must be > 0".to_string(),
        ));
    }
    if settings.transport.default_deadline_ms == 0 {
        return Err(SettingsError::Validation(
            "transport.default_deadline_ms must be > 0".to_string(),
        ));
    }
    if settings.transport.baud == 0 {
        return Err(SettingsError::Validation(
            "transport.baud must be > 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[engine]
max_nested_depth = 8

[transport]
port = "/dev/ttyACM3"
"#
        )
        .unwrap();

        let settings = load_from_path(file.path()).unwrap();
        assert_eq!(settings.engine.max_nested_depth, 8);
        assert_eq!(settings.transport.port, "/dev/ttyACM3");
        assert_eq!(settings.transport.baud, 115_200);
    }

    #[test]
    fn rejects_bad_ranges() {
        let mut settings = MottoSettings::default();
        settings.events.handler_queue_capacity = 0;
        assert!(matches!(
            validate_settings(&settings),
            Err(SettingsError::Validation(_))
        ));

        let mut settings = MottoSettings::default();
        settings.idempotency.ttl_ms = 0;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        // Each env test uses its own variable so parallel runs don't race.
        std::env::set_var("MOTTO_EVENTS_QUEUE_CAPACITY", "16");
        let mut settings = MottoSettings::default();
        apply_env_overrides(&mut settings).unwrap();
        assert_eq!(settings.events.handler_queue_capacity, 16);
        std::env::remove_var("MOTTO_EVENTS_QUEUE_CAPACITY");
    }

    #[test]
    fn bad_env_value_is_a_validation_error() {
        std::env::set_var("MOTTO_TRANSPORT_BAUD", "fast");
        let mut settings = MottoSettings::default();
        let result = apply_env_overrides(&mut settings);
        std::env::remove_var("MOTTO_TRANSPORT_BAUD");
        assert!(matches!(result, Err(SettingsError::Validation(_))));
    }
}
