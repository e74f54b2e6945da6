use crate::{grammar_mismatch, FormatError};
use regex::Regex;
use std::{fmt, sync::OnceLock};

/// 加速卡厂商。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Vendor {
    Xilinx,
    Intel,
}

impl Vendor {
    /// 厂商在资源描述中使用的小写名字。
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Xilinx => "xilinx",
            Self::Intel => "intel",
        }
    }

    /// 厂商 OpenCL 平台名称中包含的关键字。
    pub const fn platform(&self) -> &'static str {
        match self {
            Self::Xilinx => "Xilinx",
            Self::Intel => "Intel",
        }
    }
}

impl fmt::Display for Vendor {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 设备身份：厂商、板卡名和版本。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Identity {
    pub vendor: Vendor,
    pub name: String,
    pub version: String,
}

impl Identity {
    /// 身份无法解析时使用的占位身份，名字和版本都是 `-`。
    pub fn placeholder(vendor: Vendor) -> Self {
        Self {
            vendor,
            name: "-".into(),
            version: "-".into(),
        }
    }

    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.name == "-" && self.version == "-"
    }
}

/// 格式为 `vendor | name | version`。
impl fmt::Display for Identity {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} | {} | {}", self.vendor, self.name, self.version)
    }
}

/// 文法是常量，首次使用时编译。
fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("constant grammar"))
}

/// 解析 Xilinx 平台的设备名，形如 `xilinx_<board>_<platform>_<major>_<minor>`。
///
/// 版本号由后三段拼接为 `<platform>_<major>.<minor>`。
pub fn parse_xilinx(raw: &str) -> Result<Identity, FormatError> {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    let grammar = regex(&GRAMMAR, r"^xilinx_([^_]+)_(.*)_([^_]+)_([^_]+)$");

    let Some(groups) = grammar.captures(raw) else {
        return Err(grammar_mismatch(format!("\"{raw}\" is not a xilinx device name")));
    };
    let [board, platform, major, minor] = groups.extract().1;
    Ok(Identity {
        vendor: Vendor::Xilinx,
        name: board.into(),
        version: format!("{platform}_{major}.{minor}"),
    })
}

/// Intel 设备名解析结果。
///
/// Intel 设备名不携带版本，只携带设备端口字符设备的主次设备号，
/// 版本要用它们在 sysfs 中找到对应的 `interface_id`。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IntelName {
    pub board: String,
    pub major: u32,
    pub minor: u32,
}

/// 解析 Intel 平台的设备名，形如 `<board> : <desc>_<major>0000<minor><x>`，
/// 主次设备号均为十六进制。
pub fn parse_intel(raw: &str) -> Result<IntelName, FormatError> {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    let grammar = regex(&GRAMMAR, r"^([^ :]+) : .*_(.+)0000(.).$");

    let Some(groups) = grammar.captures(raw) else {
        return Err(grammar_mismatch(format!("\"{raw}\" is not an intel device name")));
    };
    let [board, major, minor] = groups.extract().1;
    let hex = |s: &str| {
        u32::from_str_radix(s, 16)
            .map_err(|_| grammar_mismatch(format!("\"{s}\" in \"{raw}\" is not hexadecimal")))
    };
    Ok(IntelName {
        board: board.into(),
        major: hex(major)?,
        minor: hex(minor)?,
    })
}
