use crate::{
    error::Checked, invalid_argument, not_found, resource::Inner, Buffer, Driver, Error,
    KernelArg, Memory, Resource, Status,
};
use log::{debug, warn};
use std::{mem::size_of, sync::Arc};

/// 可以按原生字节序作为函数参数传递的标量。
pub trait Scalar: Copy {
    type Bytes: AsRef<[u8]>;

    fn to_bytes(self) -> Self::Bytes;
    fn from_bytes(bytes: &[u8]) -> Option<Self>;
}

macro_rules! scalar {
    ($($ty:ty)+) => {
        $(
            impl Scalar for $ty {
                type Bytes = [u8; size_of::<$ty>()];

                #[inline]
                fn to_bytes(self) -> Self::Bytes {
                    self.to_ne_bytes()
                }

                #[inline]
                fn from_bytes(bytes: &[u8]) -> Option<Self> {
                    bytes.try_into().ok().map(Self::from_ne_bytes)
                }
            }
        )+
    };
}

scalar!(u8 i8 u16 i16 u32 i32 u64 i64 f32 f64 usize isize);

/// 计算单元参数。
pub enum Arg<'a, D: Driver> {
    /// 按字节传递的值，不能为空。
    Raw(&'a [u8]),
    /// 缓冲区的设备存储对象。
    Buffer(&'a Buffer<D>),
}

/// 资源当前程序中一个命名函数的可运行实例，拥有私有的任务队列。
pub struct ComputeUnit<D: Driver> {
    queue: D::Queue,
    kernel: D::Kernel,
    /// 每个参数位置上需要在运行后重新绑定的页。
    pins: Box<[Option<Memory<D>>]>,
    pending: bool,
    name: String,
    slot: usize,
    generation: u64,
    resource: Arc<Inner<D>>,
}

impl<D: Driver> ComputeUnit<D> {
    /// 在资源当前程序中查找名为 `name` 的函数。
    ///
    /// 双设备资源的名字形如 `<kernel>-<binary>`，`binary` 选择设备。
    pub fn new(resource: &Resource<D>, name: &str) -> Result<Self, Error> {
        let inner = resource.inner();
        let images = inner.images();
        let generation = inner.generation();
        let (slot, kernel) = inner.strategy.resolve(&images, name)?;

        let kernel = match inner.driver.create_kernel(&images[slot].program, kernel) {
            Err(Status::INVALID_KERNEL_NAME) => {
                return Err(not_found(format!(
                    "no compute unit \"{name}\" on {}",
                    resource.identity()
                )))
            }
            result => result.checked("clCreateKernel")?,
        };
        drop(images);

        let num_args = inner
            .driver
            .kernel_num_args(&kernel)
            .checked("clGetKernelInfo(CL_KERNEL_NUM_ARGS)")?;
        let target = &inner.slots[slot];
        let queue = inner
            .driver
            .create_queue(&target.context, &target.device)
            .checked("clCreateCommandQueue")?;
        debug!("compute unit {name} on device {slot}, {num_args} args");

        Ok(Self {
            queue,
            kernel,
            pins: (0..num_args).map(|_| None).collect(),
            pending: false,
            name: name.into(),
            slot,
            generation,
            resource: inner.clone(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 所在设备的序号。
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn num_args(&self) -> usize {
        self.pins.len()
    }

    /// 绑定参数。
    ///
    /// 在固定页的变体上，绑定缓冲区同时记下它的存储区，
    /// 每次运行后把该位置重新绑定到存储区的页上。
    pub fn set_arg(&mut self, index: u32, arg: Arg<D>) -> Result<(), Error> {
        self.check()?;
        let i = index as usize;
        if i >= self.pins.len() {
            return Err(invalid_argument(format!(
                "{} has {} args, {index} is out of range",
                self.name,
                self.pins.len()
            )));
        }

        let driver = &self.resource.driver;
        match arg {
            Arg::Raw([]) => {
                return Err(invalid_argument(format!(
                    "empty value for arg {index} of {}",
                    self.name
                )))
            }
            Arg::Raw(bytes) => {
                driver
                    .set_kernel_arg(&mut self.kernel, index, KernelArg::Scalar(bytes))
                    .checked("clSetKernelArg")?;
                self.pins[i] = None
            }
            Arg::Buffer(buffer) => {
                let memory = buffer.memory();
                memory.check()?;
                if !Arc::ptr_eq(memory.resource(), &self.resource) || memory.slot() != self.slot {
                    return Err(invalid_argument(format!(
                        "buffer on memory {} is not reachable from {}",
                        memory.index(),
                        self.name
                    )));
                }
                driver
                    .set_kernel_arg(&mut self.kernel, index, KernelArg::Mem(buffer.mem()))
                    .checked("clSetKernelArg")?;
                self.pins[i] = self
                    .resource
                    .strategy
                    .pins_pages()
                    .then(|| memory.clone())
            }
        }
        Ok(())
    }

    #[inline]
    pub fn set_scalar<T: Scalar>(&mut self, index: u32, value: T) -> Result<(), Error> {
        self.set_arg(index, Arg::Raw(value.to_bytes().as_ref()))
    }

    /// 入队一次运行，然后把记下的参数位置重新绑定到对应存储区的页。
    pub fn run(&mut self) -> Result<(), Error> {
        self.check()?;
        let driver = &self.resource.driver;
        driver
            .enqueue_task(&self.queue, &self.kernel)
            .checked("clEnqueueTask")?;
        self.pending = true;

        for (i, pin) in self.pins.iter().enumerate() {
            if let Some(page) = pin.as_ref().and_then(Memory::page) {
                driver
                    .set_kernel_arg(&mut self.kernel, i as _, KernelArg::Mem(page))
                    .checked("clSetKernelArg(page)")?
            }
        }
        Ok(())
    }

    /// 阻塞直到队列中的运行全部完成。
    pub fn wait(&mut self) -> Result<(), Error> {
        self.check()?;
        self.drain()
    }

    fn drain(&mut self) -> Result<(), Error> {
        if self.pending {
            self.resource
                .driver
                .finish(&self.queue)
                .checked("clFinish")?;
            self.pending = false
        }
        Ok(())
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.resource
            .check(self.generation, &format!("compute unit {}", self.name))
    }
}

impl<D: Driver> Drop for ComputeUnit<D> {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            warn!("drop compute unit {}: {e}", self.name)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        common_cpu::Cpu,
        resource::test::{dual, intel, link, xilinx, Fixture, VADD},
        ErrorKind, Variant, PAGE,
    };
    use rand::Rng;
    use std::sync::atomic::Ordering::SeqCst;

    fn vadd(f: &Fixture, variant: Variant, n: usize, memory: usize) {
        let resource = Resource::open(f.cpu.clone(), variant, 0, &f.config).unwrap();
        resource.program(VADD).unwrap();
        let memory = Memory::open(&resource, memory).unwrap();

        let mut rng = rand::thread_rng();
        let a = (0..n).map(|_| rng.gen::<u8>()).collect::<Vec<_>>();
        let b = (0..n).map(|_| rng.gen::<u8>()).collect::<Vec<_>>();

        let mut bufs = [(); 3].map(|_| Buffer::new(&memory, n, true).unwrap());
        bufs[0].host_mut().unwrap().copy_from_slice(&a);
        bufs[1].host_mut().unwrap().copy_from_slice(&b);
        for buf in &mut bufs[..2] {
            buf.copy_to_device().unwrap();
            buf.wait().unwrap()
        }

        let mut cu = ComputeUnit::new(&resource, "vadd").unwrap();
        assert_eq!(cu.num_args(), 4);
        for (i, buf) in bufs.iter().enumerate() {
            cu.set_arg(i as _, Arg::Buffer(buf)).unwrap()
        }
        cu.set_scalar(3, n as u32).unwrap();
        cu.run().unwrap();
        cu.wait().unwrap();

        bufs[2].copy_from_device().unwrap();
        let c = bufs[2].host().unwrap();
        for i in 0..n {
            assert_eq!(c[i], a[i].wrapping_add(b[i]))
        }
    }

    #[test]
    fn test_vadd() {
        vadd(&xilinx(), Variant::Xilinx, 1000, 0);
        vadd(&intel(), Variant::Intel, 1000, 0);
    }

    #[test]
    fn test_scalar() {
        assert_eq!(1.5f32.to_bytes(), 1.5f32.to_ne_bytes());
        assert_eq!(u16::from_bytes(&7u16.to_ne_bytes()), Some(7));
        assert_eq!(u32::from_bytes(&[1, 2]), None);
    }

    #[test]
    fn test_page_pin() {
        let f = xilinx();
        let resource = Resource::open(f.cpu.clone(), Variant::Xilinx, 0, &f.config).unwrap();
        resource.program(VADD).unwrap();
        let memory = Memory::open(&resource, 0).unwrap();
        let buffer = Buffer::new(&memory, 100, false).unwrap();

        let mut cu = ComputeUnit::new(&resource, "probe").unwrap();
        cu.set_arg(0, Arg::Buffer(&buffer)).unwrap();
        cu.run().unwrap();
        cu.wait().unwrap();
        assert_eq!(f.probed.load(SeqCst), 100);
        // 第二次运行看到的是存储区的页
        cu.run().unwrap();
        cu.wait().unwrap();
        assert_eq!(f.probed.load(SeqCst), PAGE);

        cu.set_arg(0, Arg::Buffer(&buffer)).unwrap();
        cu.run().unwrap();
        cu.wait().unwrap();
        assert_eq!(f.probed.load(SeqCst), 100);
    }

    #[test]
    fn test_no_page_pin() {
        let f = intel();
        let resource = Resource::open(f.cpu.clone(), Variant::Intel, 0, &f.config).unwrap();
        resource.program(VADD).unwrap();
        let memory = Memory::open(&resource, 0).unwrap();
        let buffer = Buffer::new(&memory, 100, false).unwrap();

        let mut cu = ComputeUnit::new(&resource, "probe").unwrap();
        cu.set_arg(0, Arg::Buffer(&buffer)).unwrap();
        for _ in 0..2 {
            cu.run().unwrap();
            cu.wait().unwrap();
            assert_eq!(f.probed.load(SeqCst), 100)
        }
    }

    #[test]
    fn test_invalid() {
        let f = xilinx();
        let resource = Resource::open(f.cpu.clone(), Variant::Xilinx, 0, &f.config).unwrap();
        let e = ComputeUnit::new(&resource, "vadd").err().unwrap();
        assert!(e.is_not_found());

        resource.program(VADD).unwrap();
        let e = ComputeUnit::new(&resource, "vmul").err().unwrap();
        assert!(e.is_not_found());

        let mut cu = ComputeUnit::new(&resource, "vadd").unwrap();
        let e = cu.set_scalar(4, 0u32).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
        let e = cu.set_arg(0, Arg::Raw(&[])).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
        // 参数未全部绑定
        let e = cu.run().unwrap_err();
        assert_eq!(e.status, Some(Status::INVALID_KERNEL_ARGS));

        let other = Resource::open(f.cpu.clone(), Variant::Xilinx, 0, &f.config).unwrap();
        other.program(VADD).unwrap();
        let memory = Memory::open(&other, 0).unwrap();
        let buffer = Buffer::new(&memory, 16, false).unwrap();
        let e = cu.set_arg(0, Arg::Buffer(&buffer)).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_stale() {
        let f = xilinx();
        let resource = Resource::open(f.cpu.clone(), Variant::Xilinx, 0, &f.config).unwrap();
        resource.program(VADD).unwrap();
        let memory = Memory::open(&resource, 0).unwrap();
        let buffer = Buffer::new(&memory, 16, false).unwrap();
        let mut cu = ComputeUnit::new(&resource, "probe").unwrap();
        cu.set_arg(0, Arg::Buffer(&buffer)).unwrap();

        resource.program(VADD).unwrap();
        assert_eq!(cu.run().unwrap_err().kind, ErrorKind::Stale);
        assert_eq!(cu.set_scalar(0, 1u8).unwrap_err().kind, ErrorKind::Stale);
        assert_eq!(cu.wait().unwrap_err().kind, ErrorKind::Stale);

        let memory = Memory::open(&resource, 0).unwrap();
        let mut cu = ComputeUnit::new(&resource, "probe").unwrap();
        let e = cu.set_arg(0, Arg::Buffer(&buffer)).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Stale);
        let buffer = Buffer::new(&memory, 16, false).unwrap();
        cu.set_arg(0, Arg::Buffer(&buffer)).unwrap();
        cu.run().unwrap();
    }

    #[test]
    fn test_dual() {
        let (f, container) = dual();
        let resource = Resource::open(f.cpu.clone(), link(true), 0, &f.config).unwrap();
        resource.program(&container).unwrap();

        let e = ComputeUnit::new(&resource, "probe").err().unwrap();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);
        let e = ComputeUnit::new(&resource, "probe-middle").err().unwrap();
        assert!(e.is_not_found());

        let left = ComputeUnit::new(&resource, "probe-left").unwrap();
        assert_eq!(left.slot(), 0);
        let uuid = "22".repeat(16);
        let mut right = ComputeUnit::new(&resource, &format!("probe-{uuid}")).unwrap();
        assert_eq!(right.slot(), 1);

        // 存储区 1 在设备 0 上
        let memory = Memory::open(&resource, 1).unwrap();
        let buffer = Buffer::new(&memory, 16, false).unwrap();
        let e = right.set_arg(0, Arg::Buffer(&buffer)).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidArgument);

        let memory = Memory::open(&resource, 2).unwrap();
        let buffer = Buffer::new(&memory, 16, false).unwrap();
        right.set_arg(0, Arg::Buffer(&buffer)).unwrap();
        right.run().unwrap();
        right.wait().unwrap();
        assert_eq!(f.probed.load(SeqCst), 16);
    }

    #[test]
    fn test_release_order() {
        let f = xilinx();
        let cpu: &Cpu = &f.cpu;
        let resource = Resource::open(f.cpu.clone(), Variant::Xilinx, 0, &f.config).unwrap();
        resource.program(VADD).unwrap();
        let memory = Memory::open(&resource, 0).unwrap();
        let buffer = Buffer::new(&memory, 16, false).unwrap();
        let mut cu = ComputeUnit::new(&resource, "probe").unwrap();
        cu.set_arg(0, Arg::Buffer(&buffer)).unwrap();
        cu.run().unwrap();

        drop(resource);
        drop(memory);
        assert_ne!(cpu.live(), 0);
        drop(cu);
        assert_eq!(f.probed.load(SeqCst), 16);
        drop(buffer);
        assert_eq!(cpu.live(), 0);
    }
}
