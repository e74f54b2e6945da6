//! 传感器数据记录（SDR）的线性换算。
//!
//! 校准参数是 SDR 文件中偏移 24 起的 6 个字节，读数是传感器文件中偏移 4 处的 1 个字节。
//! 换算公式为 `(M * raw + B * 10^B_exp) * 10^R_exp`。

/// 校准参数在 SDR 文件中的偏移。
pub const CALIBRATION_OFFSET: u64 = 24;
/// 读数在传感器文件中的偏移。
pub const READING_OFFSET: u64 = 4;

/// 线性换算参数。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Calibration {
    /// 10 位有符号乘数。
    pub m: i32,
    /// 10 位有符号偏移。
    pub b: i32,
    /// 4 位有符号结果指数。
    pub r_exp: i32,
    /// 4 位有符号偏移指数。
    pub b_exp: i32,
}

impl Calibration {
    pub const fn from_bytes(p: [u8; 6]) -> Self {
        let m = (((p[1] >> 6) as i32 & 0x3) << 8) | p[0] as i32;
        let b = (((p[3] >> 6) as i32 & 0x3) << 8) | p[2] as i32;
        Self {
            m: sign_extend(m, 10),
            b: sign_extend(b, 10),
            r_exp: sign_extend((p[5] >> 4) as i32 & 0xf, 4),
            b_exp: sign_extend(p[5] as i32 & 0xf, 4),
        }
    }

    /// 编码回 6 字节的校准参数，精度字段置零。
    pub const fn to_bytes(&self) -> [u8; 6] {
        let m = self.m & 0x3ff;
        let b = self.b & 0x3ff;
        [
            m as u8,
            ((m >> 8) << 6) as u8,
            b as u8,
            ((b >> 8) << 6) as u8,
            0,
            (((self.r_exp & 0xf) << 4) | (self.b_exp & 0xf)) as u8,
        ]
    }

    pub fn decode(&self, raw: u8) -> f64 {
        let b = scale(self.b as f64, self.b_exp);
        scale(self.m as f64 * raw as f64 + b, self.r_exp)
    }
}

#[inline]
const fn sign_extend(value: i32, bits: u32) -> i32 {
    let sign = 1 << (bits - 1);
    (value ^ sign) - sign
}

/// 逐次乘除 10，与整数指数的定义保持一致。
fn scale(mut value: f64, exp: i32) -> f64 {
    if exp >= 0 {
        for _ in 0..exp {
            value *= 10.
        }
    } else {
        for _ in exp..0 {
            value /= 10.
        }
    }
    value
}
