//! 厂商差异。
//!
//! 打开资源时由 [Variant] 选定一个策略对象，此后资源、存储、缓冲区和计算单元的厂商相关行为都由它决定。

mod dual;
mod intel;
mod xilinx;

#[cfg(test)]
pub(crate) use intel::test as intel_test;

use crate::{
    error::Checked, not_found, sensor::SensorPlan, Config, Driver, Error, Fabric, Placement,
};
use accel_common::{Identity, Topology, Vendor};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// 资源的厂商变体。
pub enum Variant {
    /// 单设备 Xilinx 加速卡，拓扑从设备文件读取，存储区由隐式页缓冲区固定。
    Xilinx,
    /// 单设备 Intel 加速卡，只有一个存储区，传感器可能需要标定解码。
    Intel,
    /// 两个 Xilinx 设备组成的资源，以打包的两个二进制编程，编程后初始化互联。
    XilinxDual(Box<dyn Fabric>),
}

impl Variant {
    #[inline]
    pub fn vendor(&self) -> Vendor {
        match self {
            Self::Xilinx | Self::XilinxDual(_) => Vendor::Xilinx,
            Self::Intel => Vendor::Intel,
        }
    }

    /// 每个资源占用的设备数。
    #[inline]
    pub fn devices(&self) -> usize {
        match self {
            Self::Xilinx | Self::Intel => 1,
            Self::XilinxDual(_) => 2,
        }
    }

    /// 解析设备身份并定位遥测根目录。
    pub(crate) fn locate<D: Driver>(
        &self,
        driver: &D,
        device: &D::Device,
        config: &Config,
    ) -> Result<Located, Error> {
        match self {
            Self::Xilinx | Self::XilinxDual(_) => xilinx::locate(driver, device, config),
            Self::Intel => intel::locate(driver, device, config),
        }
    }

    pub(crate) fn into_strategy<D: Driver>(self) -> Box<dyn Strategy<D>> {
        match self {
            Self::Xilinx => Box::new(xilinx::Xilinx),
            Self::Intel => Box::new(intel::Intel),
            Self::XilinxDual(fabric) => Box::new(dual::Dual::new(fabric)),
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Xilinx => write!(f, "Xilinx"),
            Self::Intel => write!(f, "Intel"),
            Self::XilinxDual(_) => write!(f, "XilinxDual"),
        }
    }
}

/// 身份解析的结果。
#[derive(Clone, Debug)]
pub(crate) struct Located {
    pub identity: Identity,
    pub root: PathBuf,
    pub serial_no: Option<String>,
    pub pci_id: Option<String>,
}

/// 资源中的一个设备及其上下文。
pub(crate) struct Slot<D: Driver> {
    pub device: D::Device,
    pub context: D::Context,
}

/// 一个设备上已安装的程序及其拓扑。
pub(crate) struct Image<D: Driver> {
    pub program: D::Program,
    pub topology: Topology,
    /// 打包成员名。
    pub binary: Option<String>,
    /// 嵌入的构建 UUID。
    pub uuid: Option<String>,
}

impl<D: Driver> Image<D> {
    #[inline]
    pub fn new(program: D::Program, topology: Topology) -> Self {
        Self {
            program,
            topology,
            binary: None,
            uuid: None,
        }
    }
}

/// 缓冲区与主机镜像之间的数据搬运方式。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Transfer {
    /// 缓冲区使用主机指针创建，拷贝表示为迁移。
    Migrate,
    /// 显式读写。
    ReadWrite,
}

/// 厂商策略。
pub(crate) trait Strategy<D: Driver>: Send + Sync {
    fn variant(&self) -> &'static str;

    fn sensors(&self, root: &Path) -> SensorPlan;

    /// 为每个设备构建程序并读取拓扑，任何阶段失败都不返回部分结果。
    fn program(
        &self,
        driver: &D,
        slots: &[Slot<D>],
        root: &Path,
        binary: &[u8],
    ) -> Result<Vec<Image<D>>, Error>;

    fn placement(&self, bank: u32) -> Placement;

    /// 是否为每个存储区分配一个隐式页缓冲区以固定存储区。
    fn pins_pages(&self) -> bool;

    fn transfer(&self) -> Transfer;

    /// 把计算单元名解析为设备序号和函数名。
    fn resolve<'n>(&self, images: &[Image<D>], name: &'n str) -> Result<(usize, &'n str), Error> {
        if images.is_empty() {
            Err(not_found(format!("{name}: resource is not programmed")))
        } else {
            Ok((0, name))
        }
    }
}

/// 在一个设备上加载并构建程序。
pub(crate) fn build<D: Driver>(
    driver: &D,
    slot: &Slot<D>,
    binary: &[u8],
) -> Result<D::Program, Error> {
    let program = driver
        .create_program(&slot.context, &slot.device, binary)
        .checked("clCreateProgramWithBinary")?;
    driver
        .build_program(&program, &slot.device)
        .checked("clBuildProgram")?;
    Ok(program)
}
