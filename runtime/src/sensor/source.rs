use super::Telemetry;
use crate::sysfs::{self, read_at, read_line, read_value};
use accel_common::sdr::{Calibration, CALIBRATION_OFFSET, READING_OFFSET};
use log::trace;
use std::{
    io,
    path::{Path, PathBuf},
};

const AUX_CURRENT: &str = "12v AUX Current";
const AUX_VOLTAGE: &str = "12v AUX Voltage";
const BACKPLANE_CURRENT: &str = "12v Backplane Current";
const BACKPLANE_VOLTAGE: &str = "12v Backplane Voltage";
const CORE_TEMPERATURE: &str = "FPGA Core Temperature";

/// 功率来源。
#[derive(Clone, Debug)]
pub(crate) enum Power {
    /// 以微瓦为单位的标量文件。
    Micro(PathBuf),
    /// SPI 传感器目录，辅助供电和背板供电的电流电压乘积之和。
    Spi(PathBuf),
    /// 标定记录和读数文件对。
    Sdr { sdr: PathBuf, sensors: PathBuf },
}

/// 温度来源。
#[derive(Clone, Debug)]
pub(crate) enum Temperature {
    /// 以摄氏度为单位的标量文件。
    Celsius(PathBuf),
    /// SPI 传感器目录中的 FPGA 核心温度。
    Spi(PathBuf),
}

/// 一块板卡上找到的传感器。
#[derive(Clone, Default, Debug)]
pub(crate) struct SensorPlan {
    pub power: Option<Power>,
    pub temperature: Option<Temperature>,
}

impl SensorPlan {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.power.is_none() && self.temperature.is_none()
    }

    /// 采样一次，读取失败的量记为 0。
    pub fn sample(&self, telemetry: &Telemetry) {
        if let Some(power) = &self.power {
            telemetry.set_power(power.read().unwrap_or_else(|e| {
                trace!("read power from {power:?} failed: {e}");
                0.
            }))
        }
        if let Some(temperature) = &self.temperature {
            telemetry.set_temperature(temperature.read().unwrap_or_else(|e| {
                trace!("read temperature from {temperature:?} failed: {e}");
                0.
            }))
        }
    }
}

impl Power {
    pub fn read(&self) -> io::Result<f32> {
        match self {
            Self::Micro(path) => Ok((read_value::<u64>(path)? as f64 / 1e6) as _),
            Self::Spi(dir) => {
                let [aux_i, aux_v, bp_i, bp_v] = spi(
                    dir,
                    [AUX_CURRENT, AUX_VOLTAGE, BACKPLANE_CURRENT, BACKPLANE_VOLTAGE],
                )?;
                Ok(aux_i * aux_v + bp_i * bp_v)
            }
            Self::Sdr { sdr, sensors } => {
                let calibration = Calibration::from_bytes(read_at(sdr, CALIBRATION_OFFSET)?);
                let [raw] = read_at(sensors, READING_OFFSET)?;
                Ok(calibration.decode(raw) as _)
            }
        }
    }
}

impl Temperature {
    pub fn read(&self) -> io::Result<f32> {
        match self {
            Self::Celsius(path) => read_value(path),
            Self::Spi(dir) => spi(dir, [CORE_TEMPERATURE]).map(|[t]| t),
        }
    }
}

/// 按名字前缀读取 SPI 传感器，值以千分之一为单位，找不到的传感器记为 0。
fn spi<const N: usize>(dir: &Path, names: [&str; N]) -> io::Result<[f32; N]> {
    let mut ans = [0.; N];
    for sensor in sysfs::all(dir, "sensor*") {
        let name = read_line(&sensor.join("name"), 256)?;
        if let Some(i) = names.iter().position(|n| name.starts_with(n)) {
            ans[i] = read_value::<u32>(&sensor.join("value"))? as f32 / 1000.
        }
    }
    Ok(ans)
}
