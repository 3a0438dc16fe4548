use crate::db::Database;
use crate::error::ConfigError;
use std::collections::BTreeMap;

pub const SETTING_KEYS: &[&str] = &["gemini_api_key", "gemini_model", "gemini_base_url"];

fn mask(key: &str, value: &str) -> String {
    if key.ends_with("_api_key") {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            return format!("{}...{}", head, tail);
        }
        return "****".to_string();
    }
    value.to_string()
}

/// Stored settings with API keys masked for display.
pub fn get_settings(db: &Database) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut map = BTreeMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key)? {
            map.insert(key.to_string(), mask(key, &value));
        }
    }
    Ok(map)
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), ConfigError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(ConfigError::UnknownKey(key.to_string()));
    }
    db.set_setting(key, value)?;
    Ok(())
}

pub fn delete_setting(db: &Database, key: &str) -> Result<(), ConfigError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(ConfigError::UnknownKey(key.to_string()));
    }
    db.delete_setting(key)?;
    Ok(())
}
