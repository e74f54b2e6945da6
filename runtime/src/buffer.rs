use crate::{
    error::Checked, invalid_argument, variant::Transfer, Access, BufferDesc, Driver, Error,
    HostBlob, Memory,
};
use log::warn;
use std::ptr::null_mut;

/// 绑定到一个存储区的设备缓冲区，拥有私有的任务队列。
///
/// 可以附带一个页对齐的主机镜像用于拷入拷出。
/// 迁移式变体以镜像为主机指针创建只写缓冲区，拷贝表示为迁移；其他变体显式读写。
pub struct Buffer<D: Driver> {
    queue: D::Queue,
    mem: D::Mem,
    host: Option<HostBlob>,
    size: usize,
    pending: bool,
    memory: Memory<D>,
}

impl<D: Driver> Buffer<D> {
    /// 在 `memory` 上创建 `size` 字节的缓冲区，`mirror` 决定是否分配主机镜像。
    pub fn new(memory: &Memory<D>, size: usize, mirror: bool) -> Result<Self, Error> {
        memory.check()?;
        if size == 0 || size > memory.size() {
            return Err(invalid_argument(format!(
                "buffer of {size} bytes does not fit memory {} ({} bytes)",
                memory.index(),
                memory.size()
            )));
        }

        let resource = memory.resource();
        let strategy = &resource.strategy;
        let slot = &resource.slots[memory.slot()];

        let mut host = if mirror {
            Some(HostBlob::new(size)?)
        } else {
            None
        };
        let desc = match (&mut host, strategy.transfer()) {
            (Some(host), Transfer::Migrate) => BufferDesc {
                size,
                placement: strategy.placement(memory.bank()),
                access: Access::WriteOnly,
                host: host.as_mut_ptr(),
            },
            _ => BufferDesc {
                size,
                placement: strategy.placement(memory.bank()),
                access: Access::ReadWrite,
                host: null_mut(),
            },
        };
        // 主机指针来自镜像，镜像在存储对象之后释放
        let mem = unsafe { resource.driver.create_buffer(&slot.context, &desc) }
            .checked("clCreateBuffer")?;
        let queue = resource
            .driver
            .create_queue(&slot.context, &slot.device)
            .checked("clCreateCommandQueue")?;

        Ok(Self {
            queue,
            mem,
            host,
            size,
            pending: false,
            memory: memory.clone(),
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn memory(&self) -> &Memory<D> {
        &self.memory
    }

    #[inline]
    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    #[inline]
    pub(crate) fn mem(&self) -> &D::Mem {
        &self.mem
    }

    /// 异步把主机镜像拷贝到设备。
    pub fn copy_to_device(&mut self) -> Result<(), Error> {
        self.memory.check()?;
        let Some(host) = &self.host else {
            return Err(invalid_argument("buffer has no host mirror"));
        };
        let resource = self.memory.resource();
        match resource.strategy.transfer() {
            Transfer::Migrate => resource
                .driver
                .enqueue_migrate(&self.queue, &self.mem, false)
                .checked("clEnqueueMigrateMemObjects")?,
            Transfer::ReadWrite => unsafe {
                resource
                    .driver
                    .enqueue_write(&self.queue, &self.mem, host.as_ptr(), host.len())
                    .checked("clEnqueueWriteBuffer")?
            },
        }
        self.pending = true;
        Ok(())
    }

    /// 异步把设备内容拷贝到主机镜像。
    pub fn copy_from_device(&mut self) -> Result<(), Error> {
        self.memory.check()?;
        let Some(host) = &mut self.host else {
            return Err(invalid_argument("buffer has no host mirror"));
        };
        let resource = self.memory.resource();
        match resource.strategy.transfer() {
            Transfer::Migrate => resource
                .driver
                .enqueue_migrate(&self.queue, &self.mem, true)
                .checked("clEnqueueMigrateMemObjects")?,
            Transfer::ReadWrite => unsafe {
                resource
                    .driver
                    .enqueue_read(&self.queue, &self.mem, host.as_mut_ptr(), host.len())
                    .checked("clEnqueueReadBuffer")?
            },
        }
        self.pending = true;
        Ok(())
    }

    /// 阻塞直到缓冲区队列中的拷贝全部完成。
    pub fn wait(&mut self) -> Result<(), Error> {
        self.memory.check()?;
        self.drain()
    }

    /// 主机镜像，访问前排空队列。
    pub fn host(&mut self) -> Result<&[u8], Error> {
        self.drain()?;
        self.host
            .as_deref()
            .ok_or_else(|| invalid_argument("buffer has no host mirror"))
    }

    /// 可写的主机镜像，访问前排空队列。
    pub fn host_mut(&mut self) -> Result<&mut [u8], Error> {
        self.drain()?;
        self.host
            .as_deref_mut()
            .ok_or_else(|| invalid_argument("buffer has no host mirror"))
    }

    fn drain(&mut self) -> Result<(), Error> {
        if self.pending {
            self.memory
                .resource()
                .driver
                .finish(&self.queue)
                .checked("clFinish")?;
            self.pending = false
        }
        Ok(())
    }
}

impl<D: Driver> Drop for Buffer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            warn!("drop buffer on memory {}: {e}", self.memory.index())
        }
    }
}
