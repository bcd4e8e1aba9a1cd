pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{DssSettings, RetrySettings, SETTINGS_FILE, Settings};

use std::path::PathBuf;

/// dataiku-iacの設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("dataiku-iac");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// プロジェクトのdataiku.kdlファイルを探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 DATAIKU_IAC_CONFIG (直接パス指定)
/// 2. カレントディレクトリ: dataiku.local.kdl, .dataiku.local.kdl, dataiku.kdl, .dataiku.kdl
/// 3. ./.dataiku-iac/ ディレクトリ内: 同様の順序
/// 4. ~/.config/dataiku-iac/dataiku.kdl (グローバル設定)
pub fn find_project_file() -> Result<PathBuf> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var("DATAIKU_IAC_CONFIG") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    let candidates = [
        "dataiku.local.kdl",
        ".dataiku.local.kdl",
        "dataiku.kdl",
        ".dataiku.kdl",
    ];

    // 2. カレントディレクトリで検索
    for filename in &candidates {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    // 3. ./.dataiku-iac/ ディレクトリで検索
    let project_dir = current_dir.join(".dataiku-iac");
    if project_dir.is_dir() {
        for filename in &candidates {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    // 4. グローバル設定ファイル (~/.config/dataiku-iac/dataiku.kdl)
    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("dataiku-iac").join("dataiku.kdl");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ProjectFileNotFound)
}

/// 設定ファイルのパスからプロジェクトルートを求める
///
/// `.dataiku-iac/` 内のファイルならその親ディレクトリ。
pub fn project_root_of(project_file: &std::path::Path) -> Option<PathBuf> {
    let dir = project_file.parent()?;
    if dir.file_name().and_then(|n| n.to_str()) == Some(".dataiku-iac") {
        dir.parent().map(|p| p.to_path_buf())
    } else {
        Some(dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::path::Path;

    #[test]
    fn test_get_config_dir() {
        let result = get_config_dir();
        assert!(result.is_ok());

        let config_dir = result.unwrap();
        assert!(config_dir.ends_with("dataiku-iac"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_find_project_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("dataiku.kdl"), "// test").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_project_file();
        std::env::set_current_dir(original_dir).unwrap();

        assert!(result.unwrap().ends_with("dataiku.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_project_file_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("dataiku.kdl"), "// global").unwrap();
        fs::write(temp_dir.path().join("dataiku.local.kdl"), "// local").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_project_file();
        std::env::set_current_dir(original_dir).unwrap();

        // dataiku.local.kdl が優先される
        assert!(result.unwrap().ends_with("dataiku.local.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_project_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let project_dir = temp_dir.path().join(".dataiku-iac");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("dataiku.kdl"), "// in project dir").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_project_file();
        std::env::set_current_dir(original_dir).unwrap();

        assert!(result.unwrap().ends_with(".dataiku-iac/dataiku.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_project_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.kdl");
        fs::write(&config_path, "// custom").unwrap();

        temp_env::with_var("DATAIKU_IAC_CONFIG", Some(&config_path), || {
            assert_eq!(find_project_file().unwrap(), config_path);
        });
    }

    #[test]
    fn test_project_root_of() {
        assert_eq!(
            project_root_of(Path::new("/work/demo/dataiku.kdl")),
            Some(PathBuf::from("/work/demo"))
        );
        assert_eq!(
            project_root_of(Path::new("/work/demo/.dataiku-iac/dataiku.kdl")),
            Some(PathBuf::from("/work/demo"))
        );
    }
}
