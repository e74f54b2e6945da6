//! 主机模拟设备。
//!
//! 在进程内模拟加速器接口：平台和设备预先声明，二进制程序注册为一组由闭包实现的函数，
//! 任务在 [finish](Driver::finish) 时按入队顺序在调用线程上执行。

use crate::{Access, BufferDesc, Driver, KernelArg, Scalar, Status, PAGE};
use std::{
    collections::HashMap,
    mem::take,
    ptr::copy_nonoverlapping,
    sync::{
        atomic::{
            AtomicBool, AtomicUsize,
            Ordering::{Relaxed, SeqCst},
        },
        Arc, Mutex, PoisonError,
    },
};

/// 模拟的函数体。
pub type KernelFn = Arc<dyn Fn(&Args) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub name: String,
    pub pcie_bdf: String,
    pub global_mem_size: u64,
}

impl DeviceSpec {
    #[inline]
    pub fn new(name: &str, pcie_bdf: &str, global_mem_size: u64) -> Self {
        Self {
            name: name.into(),
            pcie_bdf: pcie_bdf.into(),
            global_mem_size,
        }
    }
}

pub struct Cpu {
    platforms: Vec<(String, Vec<CpuDevice>)>,
    binaries: Mutex<HashMap<Vec<u8>, Arc<Binary>>>,
    live: Arc<AtomicUsize>,
    next_device: usize,
}

struct Binary {
    kernels: HashMap<String, (u32, KernelFn)>,
    buildable: bool,
}

impl Default for Cpu {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            platforms: Vec::new(),
            binaries: Default::default(),
            live: Default::default(),
            next_device: 0,
        }
    }

    /// 声明一个平台及其设备。
    pub fn with_platform(
        mut self,
        name: &str,
        devices: impl IntoIterator<Item = DeviceSpec>,
    ) -> Self {
        let devices = devices
            .into_iter()
            .map(|spec| {
                self.next_device += 1;
                CpuDevice {
                    id: self.next_device,
                    spec: Arc::new(spec),
                }
            })
            .collect();
        self.platforms.push((name.into(), devices));
        self
    }

    /// 注册一个二进制程序，每个函数给出名字、参数个数和函数体。
    pub fn register<'a>(
        &self,
        binary: &[u8],
        kernels: impl IntoIterator<Item = (&'a str, u32, KernelFn)>,
    ) {
        let kernels = kernels
            .into_iter()
            .map(|(name, num_args, body)| (name.to_string(), (num_args, body)))
            .collect();
        self.insert(binary, Binary {
            kernels,
            buildable: true,
        })
    }

    /// 注册一个能加载但构建失败的二进制程序。
    pub fn register_broken(&self, binary: &[u8]) {
        self.insert(binary, Binary {
            kernels: HashMap::new(),
            buildable: false,
        })
    }

    /// 尚未释放的原生对象数量。
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(SeqCst)
    }

    fn insert(&self, binary: &[u8], value: Binary) {
        self.binaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(binary.to_vec(), Arc::new(value));
    }

    #[inline]
    fn live_token(&self) -> Live {
        Live::new(&self.live)
    }
}

struct Live(Arc<AtomicUsize>);

impl Live {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, SeqCst);
        Self(counter.clone())
    }
}

impl Drop for Live {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_sub(1, SeqCst);
    }
}

#[derive(Clone)]
pub struct CpuDevice {
    id: usize,
    spec: Arc<DeviceSpec>,
}

pub struct CpuContext {
    device: usize,
    _live: Live,
}

pub struct CpuQueue {
    pending: Mutex<Vec<Command>>,
    _live: Live,
}

type Command = Box<dyn FnOnce() + Send>;

pub struct CpuProgram {
    binary: Arc<Binary>,
    built: AtomicBool,
    _live: Live,
}

pub struct CpuKernel {
    body: KernelFn,
    args: Vec<Option<Value>>,
    _live: Live,
}

pub struct CpuMem(Arc<MemInner>);

struct MemInner {
    data: Mutex<Vec<u8>>,
    host: Option<HostPtr>,
    access: Access,
    _live: Live,
}

impl CpuMem {
    #[inline]
    pub fn len(&self) -> usize {
        lock(&self.0.data).len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn access(&self) -> Access {
        self.0.access
    }

    /// 设备侧内容的拷贝。
    #[inline]
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.0.data).clone()
    }
}

#[derive(Clone, Copy)]
struct HostPtr(*mut u8);

unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

#[derive(Clone)]
enum Value {
    Scalar(Vec<u8>),
    Mem(Arc<MemInner>),
}

/// 函数执行时看到的参数表，内容在入队时固定。
pub struct Args(Vec<Value>);

impl Args {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn scalar<T: Scalar>(&self, index: usize) -> Option<T> {
        match self.0.get(index)? {
            Value::Scalar(bytes) => T::from_bytes(bytes),
            Value::Mem(_) => None,
        }
    }

    /// 存储对象参数的字节数。
    pub fn mem_len(&self, index: usize) -> Option<usize> {
        self.with_mem(index, |data| data.len())
    }

    /// 访问存储对象参数，同一次调用中不要嵌套访问同一个对象。
    pub fn with_mem<R>(&self, index: usize, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        match self.0.get(index)? {
            Value::Mem(mem) => Some(f(&mut lock(&mem.data))),
            Value::Scalar(_) => None,
        }
    }
}

#[inline]
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CpuQueue {
    #[inline]
    fn push(&self, command: Command) {
        lock(&self.pending).push(command)
    }

    /// 尚未执行的任务数。
    #[inline]
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Driver for Cpu {
    type Device = CpuDevice;
    type Context = CpuContext;
    type Program = CpuProgram;
    type Kernel = CpuKernel;
    type Queue = CpuQueue;
    type Mem = CpuMem;

    fn device(&self, platform: &str, index: usize) -> Result<Option<CpuDevice>, Status> {
        Ok(self
            .platforms
            .iter()
            .find(|(name, _)| name.contains(platform))
            .and_then(|(_, devices)| devices.get(index))
            .cloned())
    }

    #[inline]
    fn device_name(&self, device: &CpuDevice) -> Result<String, Status> {
        Ok(device.spec.name.clone())
    }

    #[inline]
    fn device_pcie_bdf(&self, device: &CpuDevice) -> Result<String, Status> {
        Ok(device.spec.pcie_bdf.clone())
    }

    #[inline]
    fn device_global_mem_size(&self, device: &CpuDevice) -> Result<u64, Status> {
        Ok(device.spec.global_mem_size)
    }

    fn create_context(&self, device: &CpuDevice) -> Result<CpuContext, Status> {
        Ok(CpuContext {
            device: device.id,
            _live: self.live_token(),
        })
    }

    fn create_queue(&self, context: &CpuContext, device: &CpuDevice) -> Result<CpuQueue, Status> {
        if context.device != device.id {
            return Err(Status::INVALID_DEVICE);
        }
        Ok(CpuQueue {
            pending: Default::default(),
            _live: self.live_token(),
        })
    }

    fn create_program(
        &self,
        context: &CpuContext,
        device: &CpuDevice,
        binary: &[u8],
    ) -> Result<CpuProgram, Status> {
        if context.device != device.id {
            return Err(Status::INVALID_DEVICE);
        }
        let binary = lock(&self.binaries)
            .get(binary)
            .cloned()
            .ok_or(Status::INVALID_BINARY)?;
        Ok(CpuProgram {
            binary,
            built: AtomicBool::new(false),
            _live: self.live_token(),
        })
    }

    fn build_program(&self, program: &CpuProgram, _device: &CpuDevice) -> Result<(), Status> {
        if program.binary.buildable {
            program.built.store(true, Relaxed);
            Ok(())
        } else {
            Err(Status::BUILD_PROGRAM_FAILURE)
        }
    }

    fn create_kernel(&self, program: &CpuProgram, name: &str) -> Result<CpuKernel, Status> {
        if !program.built.load(Relaxed) {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let (num_args, body) = program
            .binary
            .kernels
            .get(name)
            .ok_or(Status::INVALID_KERNEL_NAME)?;
        Ok(CpuKernel {
            body: body.clone(),
            args: vec![None; *num_args as usize],
            _live: self.live_token(),
        })
    }

    #[inline]
    fn kernel_num_args(&self, kernel: &CpuKernel) -> Result<u32, Status> {
        Ok(kernel.args.len() as _)
    }

    fn set_kernel_arg(
        &self,
        kernel: &mut CpuKernel,
        index: u32,
        arg: KernelArg<CpuMem>,
    ) -> Result<(), Status> {
        let slot = kernel
            .args
            .get_mut(index as usize)
            .ok_or(Status::INVALID_ARG_INDEX)?;
        *slot = Some(match arg {
            KernelArg::Scalar([]) => return Err(Status::INVALID_ARG_SIZE),
            KernelArg::Scalar(bytes) => Value::Scalar(bytes.to_vec()),
            KernelArg::Mem(mem) => Value::Mem(mem.0.clone()),
        });
        Ok(())
    }

    unsafe fn create_buffer(
        &self,
        _context: &CpuContext,
        desc: &BufferDesc,
    ) -> Result<CpuMem, Status> {
        if desc.size == 0 {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let host = if desc.host.is_null() {
            None
        } else if desc.host as usize % PAGE != 0 {
            return Err(Status::INVALID_HOST_PTR);
        } else {
            Some(HostPtr(desc.host))
        };
        let mut data = vec![0u8; desc.size];
        if let Some(HostPtr(ptr)) = host {
            copy_nonoverlapping(ptr, data.as_mut_ptr(), desc.size)
        }
        Ok(CpuMem(Arc::new(MemInner {
            data: Mutex::new(data),
            host,
            access: desc.access,
            _live: self.live_token(),
        })))
    }

    unsafe fn enqueue_write(
        &self,
        queue: &CpuQueue,
        mem: &CpuMem,
        src: *const u8,
        len: usize,
    ) -> Result<(), Status> {
        if len > mem.len() {
            return Err(Status::INVALID_VALUE);
        }
        let src = HostPtr(src.cast_mut());
        let mem = mem.0.clone();
        queue.push(Box::new(move || {
            let src = src;
            unsafe { copy_nonoverlapping(src.0, lock(&mem.data).as_mut_ptr(), len) }
        }));
        Ok(())
    }

    unsafe fn enqueue_read(
        &self,
        queue: &CpuQueue,
        mem: &CpuMem,
        dst: *mut u8,
        len: usize,
    ) -> Result<(), Status> {
        if len > mem.len() {
            return Err(Status::INVALID_VALUE);
        }
        let dst = HostPtr(dst);
        let mem = mem.0.clone();
        queue.push(Box::new(move || {
            let dst = dst;
            unsafe { copy_nonoverlapping(lock(&mem.data).as_ptr(), dst.0, len) }
        }));
        Ok(())
    }

    fn enqueue_migrate(&self, queue: &CpuQueue, mem: &CpuMem, to_host: bool) -> Result<(), Status> {
        let Some(host) = mem.0.host else {
            return Err(Status::INVALID_MEM_OBJECT);
        };
        let mem = mem.0.clone();
        queue.push(Box::new(move || {
            let host = host;
            let mut data = lock(&mem.data);
            let len = data.len();
            unsafe {
                if to_host {
                    copy_nonoverlapping(data.as_ptr(), host.0, len)
                } else {
                    copy_nonoverlapping(host.0, data.as_mut_ptr(), len)
                }
            }
        }));
        Ok(())
    }

    fn enqueue_task(&self, queue: &CpuQueue, kernel: &CpuKernel) -> Result<(), Status> {
        let args = kernel
            .args
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or(Status::INVALID_KERNEL_ARGS)?;
        let body = kernel.body.clone();
        queue.push(Box::new(move || body(&Args(args))));
        Ok(())
    }

    fn finish(&self, queue: &CpuQueue) -> Result<(), Status> {
        for command in take(&mut *lock(&queue.pending)) {
            command()
        }
        Ok(())
    }
}
