use accel_common::FormatError;
use functions::{format_error, io_error};
use std::{error, fmt, io};

/// 底层加速器接口返回的状态码。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Status(pub i32);

impl Status {
    pub const DEVICE_NOT_FOUND: Self = Self(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Self = Self(-4);
    pub const OUT_OF_RESOURCES: Self = Self(-5);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-6);
    pub const BUILD_PROGRAM_FAILURE: Self = Self(-11);
    pub const INVALID_VALUE: Self = Self(-30);
    pub const INVALID_DEVICE: Self = Self(-33);
    pub const INVALID_CONTEXT: Self = Self(-34);
    pub const INVALID_COMMAND_QUEUE: Self = Self(-36);
    pub const INVALID_HOST_PTR: Self = Self(-37);
    pub const INVALID_MEM_OBJECT: Self = Self(-38);
    pub const INVALID_BINARY: Self = Self(-42);
    pub const INVALID_PROGRAM: Self = Self(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: Self = Self(-45);
    pub const INVALID_KERNEL_NAME: Self = Self(-46);
    pub const INVALID_KERNEL: Self = Self(-48);
    pub const INVALID_ARG_INDEX: Self = Self(-49);
    pub const INVALID_ARG_VALUE: Self = Self(-50);
    pub const INVALID_ARG_SIZE: Self = Self(-51);
    pub const INVALID_KERNEL_ARGS: Self = Self(-52);
    pub const INVALID_OPERATION: Self = Self(-59);
    pub const INVALID_BUFFER_SIZE: Self = Self(-61);

    /// 状态码的符号名。
    pub const fn name(&self) -> &'static str {
        match self.0 {
            0 => "CL_SUCCESS",
            -1 => "CL_DEVICE_NOT_FOUND",
            -2 => "CL_DEVICE_NOT_AVAILABLE",
            -3 => "CL_COMPILER_NOT_AVAILABLE",
            -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
            -8 => "CL_MEM_COPY_OVERLAP",
            -9 => "CL_IMAGE_FORMAT_MISMATCH",
            -10 => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -12 => "CL_MAP_FAILURE",
            -13 => "CL_MISALIGNED_SUB_BUFFER_OFFSET",
            -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
            -15 => "CL_COMPILE_PROGRAM_FAILURE",
            -16 => "CL_LINKER_NOT_AVAILABLE",
            -17 => "CL_LINK_PROGRAM_FAILURE",
            -18 => "CL_DEVICE_PARTITION_FAILED",
            -19 => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
            -30 => "CL_INVALID_VALUE",
            -31 => "CL_INVALID_DEVICE_TYPE",
            -32 => "CL_INVALID_PLATFORM",
            -33 => "CL_INVALID_DEVICE",
            -34 => "CL_INVALID_CONTEXT",
            -35 => "CL_INVALID_QUEUE_PROPERTIES",
            -36 => "CL_INVALID_COMMAND_QUEUE",
            -37 => "CL_INVALID_HOST_PTR",
            -38 => "CL_INVALID_MEM_OBJECT",
            -39 => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
            -40 => "CL_INVALID_IMAGE_SIZE",
            -41 => "CL_INVALID_SAMPLER",
            -42 => "CL_INVALID_BINARY",
            -43 => "CL_INVALID_BUILD_OPTIONS",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -47 => "CL_INVALID_KERNEL_DEFINITION",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -53 => "CL_INVALID_WORK_DIMENSION",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -55 => "CL_INVALID_WORK_ITEM_SIZE",
            -56 => "CL_INVALID_GLOBAL_OFFSET",
            -57 => "CL_INVALID_EVENT_WAIT_LIST",
            -58 => "CL_INVALID_EVENT",
            -59 => "CL_INVALID_OPERATION",
            -60 => "CL_INVALID_GL_OBJECT",
            -61 => "CL_INVALID_BUFFER_SIZE",
            -62 => "CL_INVALID_MIP_LEVEL",
            -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
            -64 => "CL_INVALID_PROPERTY",
            -65 => "CL_INVALID_IMAGE_DESCRIPTOR",
            -66 => "CL_INVALID_COMPILER_OPTIONS",
            -67 => "CL_INVALID_LINKER_OPTIONS",
            -68 => "CL_INVALID_DEVICE_PARTITION_COUNT",
            -69 => "CL_INVALID_PIPE_SIZE",
            -70 => "CL_INVALID_DEVICE_QUEUE",
            _ => "CL_UNKNOWN_ERROR",
        }
    }
}

impl fmt::Debug for Status {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl fmt::Display for Status {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// 请求的设备、存储区或函数不存在。
    NotFound,
    /// 主机资源耗尽。
    OutOfResources,
    /// 底层加速器接口调用失败。
    Platform,
    /// 设备名、拓扑或打包二进制格式错误。
    Format,
    /// 遥测或拓扑文件读取失败。
    Io,
    /// 句柄在资源重新编程之前创建，已经失效。
    Stale,
    /// 参数与句柄不匹配。
    InvalidArgument,
    /// 网络互联初始化失败。
    Fabric,
}

#[derive(Clone, Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub status: Option<Status>,
    pub info: String,
}

impl Error {
    /// 区分“不存在”和“失败”。
    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?}: {} [{status}]", self.kind, self.info),
            None => write!(f, "{:?}: {}", self.kind, self.info),
        }
    }
}

impl From<FormatError> for Error {
    #[inline]
    fn from(value: FormatError) -> Self {
        format_error(value.to_string())
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(value: io::Error) -> Self {
        io_error(value.to_string())
    }
}

/// 底层接口调用失败。
#[inline]
pub fn platform(call: &str, status: Status) -> Error {
    Error {
        kind: ErrorKind::Platform,
        status: Some(status),
        info: call.into(),
    }
}

/// 把底层接口的状态码转换为运行时错误。
pub(crate) trait Checked<T> {
    fn checked(self, call: &str) -> Result<T, Error>;
}

impl<T> Checked<T> for Result<T, Status> {
    #[inline]
    fn checked(self, call: &str) -> Result<T, Error> {
        self.map_err(|status| platform(call, status))
    }
}

pub(super) mod functions {
    use super::{Error, ErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    status: None,
                    info: info.into(),
                }
            }
        };
    }

    builder!(Error: not_found        NotFound       );
    builder!(Error: out_of_resources OutOfResources );
    builder!(Error: format_error     Format         );
    builder!(Error: io_error         Io             );
    builder!(Error: stale            Stale          );
    builder!(Error: invalid_argument InvalidArgument);
    builder!(Error: fabric_failed    Fabric         );
}
