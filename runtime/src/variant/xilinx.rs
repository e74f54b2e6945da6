use super::{build, Image, Located, Slot, Strategy, Transfer};
use crate::{
    error::Checked,
    io_error,
    sensor::{Power, SensorPlan, Temperature},
    sysfs, Config, Driver, Error, Placement,
};
use accel_common::{parse_xilinx, Topology};
use log::trace;
use std::{fs, path::Path};

pub(super) struct Xilinx;

/// 设备名解析出身份，PCIe 地址确定 sysfs 根目录。
pub(super) fn locate<D: Driver>(
    driver: &D,
    device: &D::Device,
    config: &Config,
) -> Result<Located, Error> {
    let raw = driver
        .device_name(device)
        .checked("clGetDeviceInfo(CL_DEVICE_NAME)")?;
    let identity = parse_xilinx(&raw)?;

    let bdf = driver
        .device_pcie_bdf(device)
        .checked("clGetDeviceInfo(CL_DEVICE_PCIE_BDF)")?;
    let root = config.sysfs_root.join("bus/pci/devices").join(bdf.trim());

    let serial_no = sysfs::first(&root, "xmc.*").and_then(|xmc| {
        sysfs::read_word(&xmc.join("serial_num"))
            .map_err(|e| trace!("no serial number: {e}"))
            .ok()
    });

    Ok(Located {
        identity,
        root,
        serial_no,
        pci_id: None,
    })
}

/// 管理控制器导出功率（微瓦）和 FPGA 温度。
pub(super) fn sensors(root: &Path) -> SensorPlan {
    match sysfs::first(root, "xmc.*") {
        Some(xmc) => SensorPlan {
            power: Some(Power::Micro(xmc.join("xmc_power"))),
            temperature: Some(Temperature::Celsius(xmc.join("xmc_fpga_temp"))),
        },
        None => SensorPlan::default(),
    }
}

/// 编程后设备导出的存储拓扑。
pub(super) fn read_topology(root: &Path) -> Result<Topology, Error> {
    let icap = sysfs::first(root, "icap.*")
        .ok_or_else(|| io_error(format!("no icap under {}", root.display())))?;
    let bytes = fs::read(icap.join("mem_topology"))?;
    Ok(Topology::parse(&bytes)?)
}

impl<D: Driver> Strategy<D> for Xilinx {
    #[inline]
    fn variant(&self) -> &'static str {
        "xilinx"
    }

    #[inline]
    fn sensors(&self, root: &Path) -> SensorPlan {
        sensors(root)
    }

    fn program(
        &self,
        driver: &D,
        slots: &[Slot<D>],
        root: &Path,
        binary: &[u8],
    ) -> Result<Vec<Image<D>>, Error> {
        let program = build(driver, &slots[0], binary)?;
        let topology = read_topology(root)?;
        Ok(vec![Image::new(program, topology)])
    }

    #[inline]
    fn placement(&self, bank: u32) -> Placement {
        Placement::Bank(bank)
    }

    #[inline]
    fn pins_pages(&self) -> bool {
        true
    }

    #[inline]
    fn transfer(&self) -> Transfer {
        Transfer::Migrate
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common_cpu::{Cpu, DeviceSpec};
    use accel_common::{MemBank, MemKind};

    #[test]
    fn test_locate() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bus/pci/devices/0000:03:00.1");
        fs::create_dir_all(root.join("xmc.u.1")).unwrap();
        fs::write(root.join("xmc.u.1/serial_num"), "213045123\n").unwrap();

        let cpu = Cpu::new().with_platform(
            "Xilinx",
            [
                DeviceSpec::new("xilinx_u250_xdma_201830_2", "0000:03:00.1", 1 << 34),
                DeviceSpec::new("xilinx_u250_xdma_201830_2", "0000:04:00.1", 1 << 34),
                DeviceSpec::new("u250", "0000:05:00.1", 1 << 34),
            ],
        );
        let config = Config::default().with_sysfs_root(dir.path());

        let dev = cpu.device("Xilinx", 0).unwrap().unwrap();
        let located = locate(&cpu, &dev, &config).unwrap();
        assert_eq!(located.identity.to_string(), "xilinx | u250 | xdma_201830.2");
        assert_eq!(located.root, root);
        assert_eq!(located.serial_no.as_deref(), Some("213045123"));
        assert!(!sensors(&located.root).is_empty());

        let dev = cpu.device("Xilinx", 1).unwrap().unwrap();
        let located = locate(&cpu, &dev, &config).unwrap();
        assert_eq!(located.serial_no, None);
        assert!(sensors(&located.root).is_empty());

        let dev = cpu.device("Xilinx", 2).unwrap().unwrap();
        let e = locate(&cpu, &dev, &config).unwrap_err();
        assert_eq!(e.kind, crate::ErrorKind::Format);
    }

    #[test]
    fn test_read_topology() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert_eq!(
            read_topology(root).unwrap_err().kind,
            crate::ErrorKind::Io
        );

        fs::create_dir_all(root.join("icap.u.2")).unwrap();
        let topology = Topology::new(vec![
            MemBank {
                kind: MemKind::Ddr4,
                used: true,
                size_kb: 16 << 20,
                base_address: 0x40_0000_0000,
                tag: "bank0".into(),
            },
            MemBank {
                kind: MemKind::Streaming,
                used: false,
                size_kb: 0,
                base_address: 0,
                tag: "HBM[3]".into(),
            },
        ]);
        fs::write(root.join("icap.u.2/mem_topology"), topology.to_bytes()).unwrap();
        let read = read_topology(root).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.bank(0).unwrap().memory_type(), "DDR");
        assert!(read.used_bank(1).is_none());

        fs::write(root.join("icap.u.2/mem_topology"), [1, 0, 0]).unwrap();
        assert_eq!(
            read_topology(root).unwrap_err().kind,
            crate::ErrorKind::Format
        );
    }
}
