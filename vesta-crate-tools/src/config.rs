use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// 从 TOML 文件加载配置
pub fn load_toml_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> anyhow::Result<T> {
    let content =
        fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;

    let config = toml::from_str(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path.as_ref()))?;

    Ok(config)
}

/// 配置文件存在时加载，不存在时使用默认值
///
/// 文件存在但解析失败仍然返回错误
pub fn load_toml_config_or_default<T: DeserializeOwned + Default, P: AsRef<Path>>(path: P) -> anyhow::Result<T> {
    if !path.as_ref().exists() {
        log::info!("config file {:?} not found, using defaults", path.as_ref());
        return Ok(T::default());
    }
    load_toml_config(path)
}

/// 保存配置到 TOML 文件
pub fn save_toml_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> anyhow::Result<()> {
    let content = toml::to_string_pretty(config).context("序列化配置失败")?;

    fs::write(path.as_ref(), content).with_context(|| format!("写入配置文件失败: {:?}", path.as_ref()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct SampleConfig {
        name: String,
        count: u32,
    }

    fn temp_path(file_name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("vesta-config-{}-{}", std::process::id(), file_name))
    }

    #[test]
    fn test_missing_file_uses_default() {
        let path = temp_path("missing.toml");
        let config: SampleConfig = load_toml_config_or_default(&path).unwrap();
        assert_eq!(config, SampleConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("saved.toml");
        let config = SampleConfig {
            name: "streamer".to_string(),
            count: 7,
        };
        save_toml_config(&config, &path).unwrap();

        let loaded: SampleConfig = load_toml_config(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("partial.toml");
        fs::write(&path, "count = 3\n").unwrap();

        let loaded: SampleConfig = load_toml_config(&path).unwrap();
        assert_eq!(loaded.count, 3);
        assert!(loaded.name.is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let path = temp_path("invalid.toml");
        fs::write(&path, "count = \"not a number\"\n").unwrap();

        let result: anyhow::Result<SampleConfig> = load_toml_config_or_default(&path);
        assert!(result.is_err());
        let _ = fs::remove_file(&path);
    }
}
