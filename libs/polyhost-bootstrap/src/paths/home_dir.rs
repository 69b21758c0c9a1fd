use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Errors for resolving the host home directory
#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("{0} environment variable is not set")]
    VarMissing(&'static str),
    #[error("home_dir must be an absolute path (after ~ expansion): {0}")]
    AbsoluteRequired(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(target_os = "windows")]
const USER_HOME_VARS: &[&str] = &["USERPROFILE", "HOME"];
#[cfg(not(target_os = "windows"))]
const USER_HOME_VARS: &[&str] = &["HOME"];

#[cfg(target_os = "windows")]
const DEFAULT_BASE_VAR: &str = "APPDATA";
#[cfg(not(target_os = "windows"))]
const DEFAULT_BASE_VAR: &str = "HOME";

fn user_home() -> Result<PathBuf, HomeDirError> {
    USER_HOME_VARS
        .iter()
        .find_map(|v| env::var(v).ok())
        .map(PathBuf::from)
        .ok_or(HomeDirError::VarMissing(USER_HOME_VARS[0]))
}

/// Expand a leading `~` (alone, `~/rest` or `~\rest`) to the user home.
fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return user_home();
    }
    match raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        Some(rest) => Ok(user_home()?.join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

/// Resolve the directory the host keeps its logs and state in.
///
/// A configured path may start with `~` and must be absolute after expansion.
/// Without one, `<base>/<default_subdir>` is used, where the base is `$HOME`
/// (`%APPDATA%` on Windows). With `create`, the directory is created if missing.
pub fn resolve_home_dir(
    config_home: Option<&str>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match config_home.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => {
            let expanded = expand_tilde(raw)?;
            if !expanded.is_absolute() {
                return Err(HomeDirError::AbsoluteRequired(
                    expanded.to_string_lossy().into(),
                ));
            }
            expanded
        }
        None => {
            let base = env::var(DEFAULT_BASE_VAR).map_err(|_| HomeDirError::VarMissing(DEFAULT_BASE_VAR))?;
            Path::new(&base).join(default_subdir)
        }
    };

    if create {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}
