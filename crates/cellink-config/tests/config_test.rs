// Loading, saving, and translating station profiles.
#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::time::Duration;

use figment::Jail;
use pretty_assertions::assert_eq;

use cellink_api::UserIdentity;
use cellink_config::{
    Config, ConfigError, Profile, load_config_from, profile_to_station_config, resolve_identity,
    save_config_to,
};
use cellink_core::RunMode;
use secrecy::ExposeSecret;

const TWO_STATIONS: &str = r#"
default_profile = "press"

[defaults]
port = 4841
request_timeout = "2s"

[defaults.logging]
level = "debug"

[profiles.press]
host = "10.0.0.7"
expected_device_type = 3
username = "operator"
password = "plain"

[profiles.press.poll]
plan_respond = "150ms"

[profiles.press.tags]
device_type = "Press.DeviceType"

[profiles.bender]
host = "bender.local"
port = 4900
manual = true
"#;

#[test]
fn test_file_profiles_become_station_configs() {
    Jail::expect_with(|jail| {
        jail.create_file("config.toml", TWO_STATIONS)?;
        let config = load_config_from(Path::new("config.toml")).unwrap();
        assert_eq!(config.defaults.logging.level, "debug");

        let (name, press) = config.profile(None).unwrap();
        assert_eq!(name, "press");
        let station = profile_to_station_config(press, name, &config.defaults).unwrap();
        assert_eq!(station.address(), "10.0.0.7:4841");
        assert_eq!(station.expected_device_type, 3);
        assert_eq!(station.client.request_timeout, Duration::from_secs(2));
        assert_eq!(station.poll.plan_respond, Duration::from_millis(150));
        assert_eq!(station.tags.device_type, "Press.DeviceType");
        assert_eq!(station.tags.device_state, "DeviceState");

        let (name, bender) = config.profile(Some("bender")).unwrap();
        let station = profile_to_station_config(bender, name, &config.defaults).unwrap();
        assert_eq!(station.address(), "bender.local:4900");
        assert_eq!(station.run_mode, RunMode::Manual);
        assert!(matches!(station.client.identity, UserIdentity::Anonymous));
        Ok(())
    });
}

#[test]
fn test_environment_overrides_the_file() {
    Jail::expect_with(|jail| {
        jail.create_file("config.toml", TWO_STATIONS)?;
        jail.set_env("CELLINK_DEFAULT_PROFILE", "bender");
        jail.set_env("CELLINK_PROFILES__BENDER__HOST", "10.0.0.9");
        jail.set_env("CELLINK_DEFAULTS__PORT", "5000");

        let config = load_config_from(Path::new("config.toml")).unwrap();
        assert_eq!(config.default_profile.as_deref(), Some("bender"));
        assert_eq!(config.defaults.port, 5000);
        assert_eq!(config.profiles["bender"].host, "10.0.0.9");
        Ok(())
    });
}

#[test]
fn test_password_env_wins_over_plaintext() {
    Jail::expect_with(|jail| {
        jail.create_file("config.toml", TWO_STATIONS)?;
        jail.set_env("CELLINK_PASSWORD", "from-env");

        let config = load_config_from(Path::new("config.toml")).unwrap();
        let identity = resolve_identity(&config.profiles["press"], "press").unwrap();
        let UserIdentity::UserName { user, password } = identity else {
            panic!("expected a user identity");
        };
        assert_eq!(user, "operator");
        assert_eq!(password.expose_secret(), "from-env");
        Ok(())
    });
}

#[test]
fn test_missing_file_yields_defaults() {
    Jail::expect_with(|_jail| {
        let config = load_config_from(Path::new("absent.toml")).unwrap();
        assert_eq!(config.default_profile.as_deref(), Some("default"));
        assert_eq!(config.defaults.port, 4840);
        assert!(config.profiles.is_empty());
        assert!(matches!(
            config.profile(None),
            Err(ConfigError::Validation { .. })
        ));
        Ok(())
    });
}

#[test]
fn test_saved_config_loads_back() {
    Jail::expect_with(|_jail| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.defaults.request_timeout = "750ms".into();
        config.profiles.insert(
            "default".into(),
            toml::from_str::<Profile>("host = \"cell.local\"\nmanual = true").unwrap(),
        );
        save_config_to(&config, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[profiles.default]"), "{text}");

        let loaded = load_config_from(&path).unwrap();
        let (name, profile) = loaded.profile(None).unwrap();
        let station = profile_to_station_config(profile, name, &loaded.defaults).unwrap();
        assert_eq!(station.host, "cell.local");
        assert_eq!(station.run_mode, RunMode::Manual);
        assert_eq!(station.client.request_timeout, Duration::from_millis(750));
        Ok(())
    });
}
