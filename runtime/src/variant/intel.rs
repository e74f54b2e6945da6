use super::{build, Image, Located, Slot, Strategy, Transfer};
use crate::{
    error::Checked,
    format_error, io_error,
    sensor::{Power, SensorPlan, Temperature},
    sysfs, Config, Driver, Error, Placement,
};
use accel_common::{parse_intel, Identity, IntelName, Topology, Vendor};
use log::trace;
use std::{fs, path::Path};

pub(super) struct Intel;

/// `interface_id` 的最大长度。
const UUID: usize = 32;

/// 设备名给出端口的主次设备号，在 sysfs 中找到这个端口后从同一 FPGA 的 FME 读取 `interface_id` 作为版本。
pub(super) fn locate<D: Driver>(
    driver: &D,
    device: &D::Device,
    config: &Config,
) -> Result<Located, Error> {
    let raw = driver
        .device_name(device)
        .checked("clGetDeviceInfo(CL_DEVICE_NAME)")?;
    let IntelName {
        board,
        major,
        minor,
    } = parse_intel(&raw)?;

    // 设备已由驱动列出，找不到端口说明 sysfs 布局不符
    let devices = config.sysfs_root.join("bus/pci/devices");
    let port = sysfs::all(&devices, "*/fpga/intel-fpga-dev.*/intel-fpga-port.*/dev")
        .into_iter()
        .find(|dev| is_port(dev, major, minor))
        .ok_or_else(|| {
            format_error(format!(
                "no fpga port {major}:{minor} for {board} under {}",
                devices.display()
            ))
        })?;

    let fpga = port
        .ancestors()
        .nth(2)
        .ok_or_else(|| io_error(format!("{} has no fpga device", port.display())))?;
    let interface_id = sysfs::first(fpga, "intel-fpga-fme.*/pr/interface_id")
        .ok_or_else(|| io_error(format!("no interface id under {}", fpga.display())))?;
    let version = sysfs::read_line(&interface_id, UUID)?;
    if version.is_empty() {
        return Err(format_error(format!("{} is empty", interface_id.display())));
    }

    let root = interface_id
        .ancestors()
        .nth(2)
        .ok_or_else(|| io_error(format!("{} has no fme", interface_id.display())))?
        .to_path_buf();
    let pci_id = root
        .ancestors()
        .nth(3)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned());

    Ok(Located {
        identity: Identity {
            vendor: Vendor::Intel,
            name: board,
            version,
        },
        root,
        serial_no: None,
        pci_id,
    })
}

fn is_port(dev: &Path, major: u32, minor: u32) -> bool {
    let text = match fs::read_to_string(dev) {
        Ok(text) => text,
        Err(e) => {
            trace!("skip {}: {e}", dev.display());
            return false;
        }
    };
    let Some((maj, min)) = text.trim().split_once(':') else {
        return false;
    };
    maj.parse() == Ok(major) && min.parse() == Ok(minor)
}

/// SPI 传感器优先；否则功率来自 BMC 标定记录，温度来自热管理文件。
pub(super) fn sensors(root: &Path) -> SensorPlan {
    if let Some(spi) = sysfs::first(root, "spi-altera*.auto/spi_master/spi*/spi*.*") {
        return SensorPlan {
            power: Some(Power::Spi(spi.clone())),
            temperature: Some(Temperature::Spi(spi)),
        };
    }
    let power = sysfs::first(root, "avmmi-bmc.*.auto/bmc_info").map(|bmc| Power::Sdr {
        sdr: bmc.join("sdr"),
        sensors: bmc.join("sensors"),
    });
    let thermal = root.join("thermal_mgmt/temperature");
    let temperature = thermal.is_file().then_some(Temperature::Celsius(thermal));
    SensorPlan { power, temperature }
}

impl<D: Driver> Strategy<D> for Intel {
    #[inline]
    fn variant(&self) -> &'static str {
        "intel"
    }

    #[inline]
    fn sensors(&self, root: &Path) -> SensorPlan {
        sensors(root)
    }

    /// 只有一个存储区，容量为设备全局存储容量。
    fn program(
        &self,
        driver: &D,
        slots: &[Slot<D>],
        _root: &Path,
        binary: &[u8],
    ) -> Result<Vec<Image<D>>, Error> {
        let slot = &slots[0];
        let program = build(driver, slot, binary)?;
        let size = driver
            .device_global_mem_size(&slot.device)
            .checked("clGetDeviceInfo(CL_DEVICE_GLOBAL_MEM_SIZE)")?;
        Ok(vec![Image::new(program, Topology::single(size, "DDR"))])
    }

    #[inline]
    fn placement(&self, bank: u32) -> Placement {
        Placement::Channel(bank)
    }

    #[inline]
    fn pins_pages(&self) -> bool {
        false
    }

    #[inline]
    fn transfer(&self) -> Transfer {
        Transfer::ReadWrite
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        common_cpu::{Cpu, DeviceSpec},
        ErrorKind,
    };
    use std::path::PathBuf;

    pub const NAME: &str = "pac_s10_dc : Intel PAC Platform (pac_1f800001)";
    pub const INTERFACE_ID: &str = "bfac4d851ee856fe8c95865ce1bbaa2d";

    /// 两块板卡，第二块的端口号与设备名匹配，返回它的 FME 目录。
    pub fn tree(sysfs: &Path) -> PathBuf {
        for (bdf, dev) in [("0000:3b:00.0", "504:0"), ("0000:5e:00.0", "504:1")] {
            let fpga = sysfs.join(format!("bus/pci/devices/{bdf}/fpga/intel-fpga-dev.0"));
            fs::create_dir_all(fpga.join("intel-fpga-port.0")).unwrap();
            fs::create_dir_all(fpga.join("intel-fpga-fme.0/pr")).unwrap();
            fs::write(fpga.join("intel-fpga-port.0/dev"), format!("{dev}\n")).unwrap();
            fs::write(
                fpga.join("intel-fpga-fme.0/pr/interface_id"),
                format!("{INTERFACE_ID}xyz\n"),
            )
            .unwrap();
        }
        sysfs.join("bus/pci/devices/0000:5e:00.0/fpga/intel-fpga-dev.0/intel-fpga-fme.0")
    }

    #[test]
    fn test_locate() {
        let dir = tempfile::tempdir().unwrap();
        let fme = tree(dir.path());
        let cpu = Cpu::new().with_platform(
            "Intel(R) FPGA SDK for OpenCL(TM)",
            [
                DeviceSpec::new(NAME, "", 8 << 30),
                DeviceSpec::new("pac_s10_dc : Intel PAC Platform (pac_1f800002)", "", 8 << 30),
            ],
        );
        let config = Config::default().with_sysfs_root(dir.path());

        let dev = cpu.device("Intel", 0).unwrap().unwrap();
        let located = locate(&cpu, &dev, &config).unwrap();
        assert_eq!(
            located.identity.to_string(),
            format!("intel | pac_s10_dc | {INTERFACE_ID}")
        );
        assert_eq!(located.root, fme);
        assert_eq!(located.pci_id.as_deref(), Some("0000:5e:00.0"));

        let dev = cpu.device("Intel", 1).unwrap().unwrap();
        let e = locate(&cpu, &dev, &config).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Format);
        assert!(e.info.contains("504:2"));
        assert!(!e.is_not_found());

        fs::write(fme.join("pr/interface_id"), "\n").unwrap();
        let dev = cpu.device("Intel", 0).unwrap().unwrap();
        assert_eq!(
            locate(&cpu, &dev, &config).unwrap_err().kind,
            ErrorKind::Format
        );
    }

    #[test]
    fn test_sensors() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert!(sensors(root).is_empty());

        fs::create_dir_all(root.join("thermal_mgmt")).unwrap();
        fs::write(root.join("thermal_mgmt/temperature"), "52\n").unwrap();
        let plan = sensors(root);
        assert!(plan.power.is_none());
        assert!(matches!(plan.temperature, Some(Temperature::Celsius(_))));

        fs::create_dir_all(root.join("avmmi-bmc.3.auto/bmc_info")).unwrap();
        let plan = sensors(root);
        assert!(matches!(plan.power, Some(Power::Sdr { .. })));

        fs::create_dir_all(root.join("spi-altera.0.auto/spi_master/spi0/spi0.0")).unwrap();
        let plan = sensors(root);
        assert!(matches!(plan.power, Some(Power::Spi(_))));
        assert!(matches!(plan.temperature, Some(Temperature::Spi(_))));
    }
}
