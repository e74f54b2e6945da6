use log::warn;
use std::{env, path::PathBuf, time::Duration};

/// 运行时配置。
#[derive(Clone, Debug)]
pub struct Config {
    /// sysfs 挂载点，设备根目录和遥测文件都在其下查找。
    pub sysfs_root: PathBuf,
    /// 传感器采样周期。
    pub sample_period: Duration,
}

pub const SYSFS_ROOT_ENV: &str = "ACCEL_SYSFS_ROOT";
pub const SAMPLE_PERIOD_ENV: &str = "ACCEL_SAMPLE_PERIOD_MS";

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            sysfs_root: "/sys".into(),
            sample_period: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// 从环境变量读取配置，未设置或无法解析的项使用默认值。
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var_os(SYSFS_ROOT_ENV).map(PathBuf::from),
            env::var(SAMPLE_PERIOD_ENV).ok(),
        )
    }

    fn from_vars(root: Option<PathBuf>, period: Option<String>) -> Self {
        let mut ans = Self::default();
        if let Some(root) = root.filter(|p| !p.as_os_str().is_empty()) {
            ans.sysfs_root = root
        }
        if let Some(period) = period {
            match period.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => ans.sample_period = Duration::from_millis(ms),
                _ => warn!("ignore invalid {SAMPLE_PERIOD_ENV}={period:?}"),
            }
        }
        ans
    }

    #[inline]
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    #[inline]
    pub fn with_sample_period(mut self, period: Duration) -> Self {
        self.sample_period = period;
        self
    }
}

#[test]
fn test_from_vars() {
    let config = Config::from_vars(None, None);
    assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
    assert_eq!(config.sample_period, Duration::from_secs(1));

    let config = Config::from_vars(Some("/tmp/fake".into()), Some(" 250 ".into()));
    assert_eq!(config.sysfs_root, PathBuf::from("/tmp/fake"));
    assert_eq!(config.sample_period, Duration::from_millis(250));

    let config = Config::from_vars(Some("".into()), Some("0".into()));
    assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
    assert_eq!(config.sample_period, Duration::from_secs(1));
}
