use std::{cmp::Ordering, fmt};

/// 对象版本号
///
/// 版本号是一个序列号：0 表示没有版本，第一个版本为 1，
/// 到达 u32::MAX 后回绕到 1。比较时使用序列号算术，
/// 两个版本相差不超过 2^31 时比较结果正确。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(pub u32);

impl Version {
    pub const NONE: Version = Version(0);
    pub const FIRST: Version = Version(1);

    pub fn next(self) -> Version {
        match self.0.wrapping_add(1) {
            0 => Version::FIRST,
            v => Version(v),
        }
    }

    pub fn is_none(self) -> bool {
        self == Version::NONE
    }

    /// self 是否比 other 新
    pub fn is_newer_than(self, other: Version) -> bool {
        if other.is_none() {
            return !self.is_none();
        }
        if self.is_none() {
            return false;
        }
        (self.0.wrapping_sub(other.0) as i32) > 0
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.is_newer_than(*other) {
            Some(Ordering::Greater)
        } else {
            Some(Ordering::Less)
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u32> for Version {
    fn from(v: u32) -> Self {
        Version(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_skips_none() {
        assert_eq!(Version::NONE.next(), Version::FIRST);
        assert_eq!(Version(41).next(), Version(42));
        assert_eq!(Version(u32::MAX).next(), Version::FIRST);
    }

    #[test]
    fn serial_comparison() {
        assert!(Version(2) > Version(1));
        assert!(Version(1) < Version(2));
        assert!(Version::FIRST > Version::NONE);
        assert!(!Version::NONE.is_newer_than(Version(5)));
        // 回绕之后仍然更新
        assert!(Version::FIRST > Version(u32::MAX));
        assert!(Version(3) > Version(u32::MAX - 3));
        assert!(Version(7) <= Version(7));
    }
}
