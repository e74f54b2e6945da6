//! OpenCL 设备。
//!
//! 直接调用 [clrt] 导出的原生接口，失败的调用都以状态码的符号名记录一条错误日志。
//! 二进制程序、扩展指针缓冲区和迁移都要用到原生句柄，因此上下文和队列也以原生句柄持有。

use crate::{Access, BufferDesc, Driver, KernelArg, Status};
use clrt::bindings::{
    clBuildProgram, clCreateBuffer, clCreateCommandQueue, clCreateContext, clCreateKernel,
    clCreateProgramWithBinary, clEnqueueMigrateMemObjects, clEnqueueReadBuffer, clEnqueueTask,
    clEnqueueWriteBuffer, clFinish, clGetDeviceIDs, clGetDeviceInfo, clGetKernelInfo,
    clGetPlatformIDs, clGetPlatformInfo, clReleaseCommandQueue, clReleaseContext,
    clReleaseKernel, clReleaseMemObject, clReleaseProgram, clSetKernelArg, cl_command_queue,
    cl_context, cl_device_id, cl_int, cl_kernel, cl_mem, cl_platform_id, cl_program, cl_uint,
};
use log::error;
use std::{
    ffi::{c_void, CString},
    mem::size_of,
    ptr::{null, null_mut},
};

const CL_SUCCESS: cl_int = 0;
const CL_DEVICE_NOT_FOUND: cl_int = -1;
const CL_PLATFORM_NOT_FOUND_KHR: cl_int = -1001;
const CL_FALSE: cl_uint = 0;

const CL_PLATFORM_NAME: cl_uint = 0x0902;
const CL_DEVICE_TYPE_ALL: u64 = 0xffff_ffff;
const CL_DEVICE_GLOBAL_MEM_SIZE: cl_uint = 0x101f;
const CL_DEVICE_NAME: cl_uint = 0x102b;
const CL_DEVICE_PCIE_BDF: cl_uint = 0x1120;
const CL_KERNEL_NUM_ARGS: cl_uint = 0x1191;

const CL_MEM_READ_WRITE: u64 = 1 << 0;
const CL_MEM_WRITE_ONLY: u64 = 1 << 1;
const CL_MEM_USE_HOST_PTR: u64 = 1 << 3;
const CL_MIGRATE_MEM_OBJECT_HOST: u64 = 1 << 0;

/// 以扩展指针指定存储区时传给 `clCreateBuffer` 的结构。
#[repr(C)]
struct MemExtPtr {
    flags: cl_uint,
    obj: *mut c_void,
    param: *mut c_void,
}

/// 系统中安装的 OpenCL 实现。
#[derive(Clone, Copy, Default, Debug)]
pub struct ClDriver;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct ClDevice(cl_device_id);

macro_rules! handle {
    ($name:ident: $raw:ty, $release:ident) => {
        #[repr(transparent)]
        pub struct $name($raw);

        impl Drop for $name {
            #[inline]
            fn drop(&mut self) {
                let code = unsafe { $release(self.0) };
                if code != CL_SUCCESS {
                    error!("{} failed: {}", stringify!($release), Status(code))
                }
            }
        }

        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

handle!(ClContext: cl_context, clReleaseContext);
handle!(ClQueue: cl_command_queue, clReleaseCommandQueue);
handle!(ClProgram: cl_program, clReleaseProgram);
handle!(ClKernel: cl_kernel, clReleaseKernel);
handle!(ClMem: cl_mem, clReleaseMemObject);

unsafe impl Send for ClDevice {}
unsafe impl Sync for ClDevice {}

fn check(call: &str, code: cl_int) -> Result<(), Status> {
    if code == CL_SUCCESS {
        Ok(())
    } else {
        let status = Status(code);
        error!("{call} failed: {status}");
        Err(status)
    }
}

/// 先查询长度再读取的字符串属性，去掉结尾的 NUL。
fn info_string(
    call: &str,
    f: impl Fn(usize, *mut c_void, *mut usize) -> cl_int,
) -> Result<String, Status> {
    let mut size = 0;
    check(call, f(0, null_mut(), &mut size))?;
    let mut buf = vec![0u8; size];
    check(call, f(size, buf.as_mut_ptr().cast(), null_mut()))?;
    if let Some(nul) = buf.iter().position(|&b| b == 0) {
        buf.truncate(nul)
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn platforms() -> Result<Vec<cl_platform_id>, Status> {
    let mut num = 0;
    match unsafe { clGetPlatformIDs(0, null_mut(), &mut num) } {
        CL_PLATFORM_NOT_FOUND_KHR => return Ok(Vec::new()),
        code => check("clGetPlatformIDs", code)?,
    }
    let mut ans = vec![null_mut(); num as usize];
    check("clGetPlatformIDs", unsafe {
        clGetPlatformIDs(num, ans.as_mut_ptr(), null_mut())
    })?;
    Ok(ans)
}

fn devices(platform: cl_platform_id) -> Result<Vec<cl_device_id>, Status> {
    let mut num = 0;
    match unsafe { clGetDeviceIDs(platform, CL_DEVICE_TYPE_ALL as _, 0, null_mut(), &mut num) } {
        CL_DEVICE_NOT_FOUND => return Ok(Vec::new()),
        code => check("clGetDeviceIDs", code)?,
    }
    let mut ans = vec![null_mut(); num as usize];
    check("clGetDeviceIDs", unsafe {
        clGetDeviceIDs(
            platform,
            CL_DEVICE_TYPE_ALL as _,
            num,
            ans.as_mut_ptr(),
            null_mut(),
        )
    })?;
    Ok(ans)
}

impl Driver for ClDriver {
    type Device = ClDevice;
    type Context = ClContext;
    type Program = ClProgram;
    type Kernel = ClKernel;
    type Queue = ClQueue;
    type Mem = ClMem;

    fn device(&self, platform: &str, index: usize) -> Result<Option<ClDevice>, Status> {
        for id in platforms()? {
            let name =
                info_string("clGetPlatformInfo(CL_PLATFORM_NAME)", |size, value, ret| unsafe {
                    clGetPlatformInfo(id, CL_PLATFORM_NAME as _, size, value, ret)
                })?;
            if name.contains(platform) {
                return Ok(devices(id)?.get(index).copied().map(ClDevice));
            }
        }
        Ok(None)
    }

    fn device_name(&self, device: &ClDevice) -> Result<String, Status> {
        info_string("clGetDeviceInfo(CL_DEVICE_NAME)", |size, value, ret| unsafe {
            clGetDeviceInfo(device.0, CL_DEVICE_NAME as _, size, value, ret)
        })
    }

    fn device_pcie_bdf(&self, device: &ClDevice) -> Result<String, Status> {
        info_string("clGetDeviceInfo(CL_DEVICE_PCIE_BDF)", |size, value, ret| unsafe {
            clGetDeviceInfo(device.0, CL_DEVICE_PCIE_BDF as _, size, value, ret)
        })
    }

    fn device_global_mem_size(&self, device: &ClDevice) -> Result<u64, Status> {
        let mut size = 0u64;
        check("clGetDeviceInfo(CL_DEVICE_GLOBAL_MEM_SIZE)", unsafe {
            clGetDeviceInfo(
                device.0,
                CL_DEVICE_GLOBAL_MEM_SIZE as _,
                size_of::<u64>(),
                (&mut size as *mut u64).cast(),
                null_mut(),
            )
        })?;
        Ok(size)
    }

    fn create_context(&self, device: &ClDevice) -> Result<ClContext, Status> {
        let mut code = CL_SUCCESS;
        let context =
            unsafe { clCreateContext(null(), 1, &device.0, None, null_mut(), &mut code) };
        check("clCreateContext", code)?;
        Ok(ClContext(context))
    }

    fn create_queue(&self, context: &ClContext, device: &ClDevice) -> Result<ClQueue, Status> {
        let mut code = CL_SUCCESS;
        let queue = unsafe { clCreateCommandQueue(context.0, device.0, 0, &mut code) };
        check("clCreateCommandQueue", code)?;
        Ok(ClQueue(queue))
    }

    fn create_program(
        &self,
        context: &ClContext,
        device: &ClDevice,
        binary: &[u8],
    ) -> Result<ClProgram, Status> {
        let mut code = CL_SUCCESS;
        let mut binary_status = CL_SUCCESS;
        let len = binary.len();
        let mut ptr = binary.as_ptr();
        let program = unsafe {
            clCreateProgramWithBinary(
                context.0,
                1,
                &device.0,
                &len,
                &mut ptr,
                &mut binary_status,
                &mut code,
            )
        };
        check("clCreateProgramWithBinary", code)?;
        let program = ClProgram(program);
        check("clCreateProgramWithBinary(binary_status)", binary_status)?;
        Ok(program)
    }

    fn build_program(&self, program: &ClProgram, device: &ClDevice) -> Result<(), Status> {
        check("clBuildProgram", unsafe {
            clBuildProgram(program.0, 1, &device.0, null(), None, null_mut())
        })
    }

    fn create_kernel(&self, program: &ClProgram, name: &str) -> Result<ClKernel, Status> {
        let name = CString::new(name).map_err(|_| Status::INVALID_KERNEL_NAME)?;
        let mut code = CL_SUCCESS;
        let kernel = unsafe { clCreateKernel(program.0, name.as_ptr(), &mut code) };
        check("clCreateKernel", code)?;
        Ok(ClKernel(kernel))
    }

    fn kernel_num_args(&self, kernel: &ClKernel) -> Result<u32, Status> {
        let mut num: cl_uint = 0;
        check("clGetKernelInfo(CL_KERNEL_NUM_ARGS)", unsafe {
            clGetKernelInfo(
                kernel.0,
                CL_KERNEL_NUM_ARGS as _,
                size_of::<cl_uint>(),
                (&mut num as *mut cl_uint).cast(),
                null_mut(),
            )
        })?;
        Ok(num)
    }

    fn set_kernel_arg(
        &self,
        kernel: &mut ClKernel,
        index: u32,
        arg: KernelArg<ClMem>,
    ) -> Result<(), Status> {
        let (size, value): (usize, *const c_void) = match arg {
            KernelArg::Scalar(bytes) => (bytes.len(), bytes.as_ptr().cast()),
            KernelArg::Mem(mem) => (size_of::<cl_mem>(), (&mem.0 as *const cl_mem).cast()),
        };
        check("clSetKernelArg", unsafe {
            clSetKernelArg(kernel.0, index, size, value)
        })
    }

    unsafe fn create_buffer(
        &self,
        context: &ClContext,
        desc: &BufferDesc,
    ) -> Result<ClMem, Status> {
        let mut flags = match desc.access {
            Access::ReadWrite => CL_MEM_READ_WRITE,
            Access::WriteOnly => CL_MEM_WRITE_ONLY,
        };
        if !desc.host.is_null() {
            flags |= CL_MEM_USE_HOST_PTR
        }
        flags |= desc.placement.channel_flags();

        let mut ext = MemExtPtr {
            flags: 0,
            obj: desc.host.cast(),
            param: null_mut(),
        };
        let host: *mut c_void = match desc.placement.ext_flags() {
            Some(ext_flags) => {
                ext.flags = ext_flags;
                flags |= crate::Placement::EXT_PTR as u64;
                (&mut ext as *mut MemExtPtr).cast()
            }
            None => desc.host.cast(),
        };

        let mut code = CL_SUCCESS;
        let mem = clCreateBuffer(context.0, flags as _, desc.size, host, &mut code);
        check("clCreateBuffer", code)?;
        Ok(ClMem(mem))
    }

    unsafe fn enqueue_write(
        &self,
        queue: &ClQueue,
        mem: &ClMem,
        src: *const u8,
        len: usize,
    ) -> Result<(), Status> {
        check(
            "clEnqueueWriteBuffer",
            clEnqueueWriteBuffer(
                queue.0,
                mem.0,
                CL_FALSE,
                0,
                len,
                src.cast(),
                0,
                null(),
                null_mut(),
            ),
        )
    }

    unsafe fn enqueue_read(
        &self,
        queue: &ClQueue,
        mem: &ClMem,
        dst: *mut u8,
        len: usize,
    ) -> Result<(), Status> {
        check(
            "clEnqueueReadBuffer",
            clEnqueueReadBuffer(
                queue.0,
                mem.0,
                CL_FALSE,
                0,
                len,
                dst.cast(),
                0,
                null(),
                null_mut(),
            ),
        )
    }

    fn enqueue_migrate(&self, queue: &ClQueue, mem: &ClMem, to_host: bool) -> Result<(), Status> {
        let flags = if to_host { CL_MIGRATE_MEM_OBJECT_HOST } else { 0 };
        check("clEnqueueMigrateMemObjects", unsafe {
            clEnqueueMigrateMemObjects(queue.0, 1, &mem.0, flags as _, 0, null(), null_mut())
        })
    }

    fn enqueue_task(&self, queue: &ClQueue, kernel: &ClKernel) -> Result<(), Status> {
        check("clEnqueueTask", unsafe {
            clEnqueueTask(queue.0, kernel.0, 0, null(), null_mut())
        })
    }

    fn finish(&self, queue: &ClQueue) -> Result<(), Status> {
        check("clFinish", unsafe { clFinish(queue.0) })
    }
}

#[test]
fn test_probe() {
    use accel_common::Vendor;
    use clrt::Platform;

    let mut names = Vec::new();
    for platform in Platform::all() {
        for device in platform.devices() {
            names.push(device.name().to_string())
        }
    }

    for vendor in [Vendor::Xilinx, Vendor::Intel] {
        let Some(device) = ClDriver.device(vendor.platform(), 0).unwrap() else {
            continue;
        };
        let name = ClDriver.device_name(&device).unwrap();
        assert!(names.contains(&name));
        let size = ClDriver.device_global_mem_size(&device).unwrap();
        println!("{vendor}: {name} ({size} bytes)");
        let context = ClDriver.create_context(&device).unwrap();
        ClDriver.create_queue(&context, &device).unwrap();
    }
}
