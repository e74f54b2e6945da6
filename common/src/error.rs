use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FormatErrorKind {
    /// 输入在声明的长度之前结束。
    Truncated,
    /// 魔数或文件头不匹配。
    BadMagic,
    /// 字段取值非法。
    BadField,
    /// 设备名称不符合厂商命名规则。
    GrammarMismatch,
}

#[derive(Clone, Debug)]
pub struct FormatError {
    pub kind: FormatErrorKind,
    pub info: String,
}

impl Error for FormatError {}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

pub(super) mod functions {
    use super::{FormatError, FormatErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(FormatError: truncated        Truncated      );
    builder!(FormatError: bad_magic        BadMagic       );
    builder!(FormatError: bad_field        BadField       );
    builder!(FormatError: grammar_mismatch GrammarMismatch);
}
