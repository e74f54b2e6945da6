//! FPGA 加速卡运行时。
//!
//! 以统一的 [Resource]、[Memory]、[Buffer] 和 [ComputeUnit] 抽象驱动不同厂商的加速卡，
//! 厂商差异由打开资源时选择的 [Variant] 决定。

mod blob;
mod buffer;
mod compute_unit;
mod config;
mod error;
mod handle;
mod memory;
mod resource;
mod sensor;
mod sysfs;
mod variant;

pub mod fabric;

pub use accel_common::{Identity, MemKind, Topology, Vendor};
pub use blob::{HostBlob, PAGE};
pub use buffer::Buffer;
pub use compute_unit::{Arg, ComputeUnit, Scalar};
pub use config::{Config, SAMPLE_PERIOD_ENV, SYSFS_ROOT_ENV};
pub use error::{functions::*, platform, Error, ErrorKind, Status};
pub use fabric::Fabric;
pub use memory::Memory;
pub use resource::{describe, Resource};
pub use sensor::SamplerState;
pub use variant::Variant;

#[cfg(any(use_cpu, test))]
pub use handle::common_cpu;

#[cfg(use_cl)]
pub use handle::opencl;
#[cfg(use_cl)]
pub extern crate clrt;

/// 加速器接口抽象。
///
/// 约定运行时如何发现设备、编程和搬运数据。
/// 关联类型都是拥有所有权的原生对象，释放即销毁。
pub trait Driver: Send + Sync + 'static {
    /// 设备。
    type Device: Clone + Send + Sync;
    /// 设备上下文。
    type Context: Send + Sync;
    /// 已加载的二进制程序。
    type Program: Send + Sync;
    /// 程序中的一个函数实例。
    type Kernel: Send + Sync;
    /// 任务队列。
    type Queue: Send + Sync;
    /// 设备存储对象。
    type Mem: Send + Sync;

    /// 在名字包含 `platform` 的平台上按序号取设备，不存在时返回 `None`。
    fn device(&self, platform: &str, index: usize) -> Result<Option<Self::Device>, Status>;
    fn device_name(&self, device: &Self::Device) -> Result<String, Status>;
    fn device_pcie_bdf(&self, device: &Self::Device) -> Result<String, Status>;
    fn device_global_mem_size(&self, device: &Self::Device) -> Result<u64, Status>;

    fn create_context(&self, device: &Self::Device) -> Result<Self::Context, Status>;
    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
    ) -> Result<Self::Queue, Status>;

    fn create_program(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        binary: &[u8],
    ) -> Result<Self::Program, Status>;
    fn build_program(&self, program: &Self::Program, device: &Self::Device) -> Result<(), Status>;

    fn create_kernel(&self, program: &Self::Program, name: &str) -> Result<Self::Kernel, Status>;
    fn kernel_num_args(&self, kernel: &Self::Kernel) -> Result<u32, Status>;
    fn set_kernel_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        arg: KernelArg<Self::Mem>,
    ) -> Result<(), Status>;

    /// 创建设备存储对象。
    ///
    /// # Safety
    ///
    /// `desc.host` 非空时必须指向至少 `desc.size` 字节的页对齐内存，且在存储对象释放前有效。
    unsafe fn create_buffer(
        &self,
        context: &Self::Context,
        desc: &BufferDesc,
    ) -> Result<Self::Mem, Status>;

    /// 异步写入设备。
    ///
    /// # Safety
    ///
    /// `src` 在队列排空前必须保持有效且不被修改。
    unsafe fn enqueue_write(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        src: *const u8,
        len: usize,
    ) -> Result<(), Status>;

    /// 异步读出设备。
    ///
    /// # Safety
    ///
    /// `dst` 在队列排空前必须保持有效且不被访问。
    unsafe fn enqueue_read(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        dst: *mut u8,
        len: usize,
    ) -> Result<(), Status>;

    /// 在主机和设备地址空间之间迁移使用主机指针的存储对象。
    fn enqueue_migrate(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        to_host: bool,
    ) -> Result<(), Status>;
    fn enqueue_task(&self, queue: &Self::Queue, kernel: &Self::Kernel) -> Result<(), Status>;
    /// 阻塞直到队列中所有任务完成。
    fn finish(&self, queue: &Self::Queue) -> Result<(), Status>;
}

/// 函数参数。
pub enum KernelArg<'a, M> {
    Scalar(&'a [u8]),
    Mem(&'a M),
}

/// 存储对象在设备上的放置方式。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Placement {
    /// 由扩展指针指定存储区。
    Bank(u32),
    /// 由创建标志中的通道位指定存储区。
    Channel(u32),
}

impl Placement {
    /// 扩展指针标志位。
    pub const EXT_PTR: u32 = 1 << 31;

    /// 扩展指针中的存储区标志。
    #[inline]
    pub const fn ext_flags(&self) -> Option<u32> {
        match *self {
            Self::Bank(bank) => Some(bank | Self::EXT_PTR),
            Self::Channel(_) => None,
        }
    }

    /// 合并到创建标志中的通道位。
    #[inline]
    pub const fn channel_flags(&self) -> u64 {
        match *self {
            Self::Bank(_) => 0,
            Self::Channel(bank) => (bank as u64) << 16,
        }
    }
}

/// 主机侧的访问方式。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Access {
    ReadWrite,
    WriteOnly,
}

/// 创建存储对象的参数。
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub size: usize,
    pub placement: Placement,
    pub access: Access,
    /// 使用的主机内存，空指针表示由设备分配。
    pub host: *mut u8,
}

#[test]
fn test_placement() {
    assert_eq!(Placement::Bank(2).ext_flags(), Some(0x8000_0002));
    assert_eq!(Placement::Bank(2).channel_flags(), 0);
    assert_eq!(Placement::Channel(1).ext_flags(), None);
    assert_eq!(Placement::Channel(1).channel_flags(), 0x1_0000);
}
