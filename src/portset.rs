/// Port number, zero based.
pub type PortNo = usize;

pub const PORT_MAX: usize = 128;

/// Fixed-size bitset of switch ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortSet(u128);

impl PortSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// All ports in `0..port_count`.
    pub fn all(port_count: usize) -> Self {
        if port_count >= PORT_MAX {
            Self(u128::MAX)
        } else {
            Self((1u128 << port_count) - 1)
        }
    }

    pub fn single(port: PortNo) -> Self {
        let mut set = Self::empty();
        set.insert(port);
        set
    }

    pub fn contains(&self, port: PortNo) -> bool {
        port < PORT_MAX && self.0 & (1u128 << port) != 0
    }

    pub fn insert(&mut self, port: PortNo) {
        if port < PORT_MAX {
            self.0 |= 1u128 << port;
        }
    }

    pub fn remove(&mut self, port: PortNo) {
        if port < PORT_MAX {
            self.0 &= !(1u128 << port);
        }
    }

    pub fn set(&mut self, port: PortNo, value: bool) {
        if value {
            self.insert(port);
        } else {
            self.remove(port);
        }
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = PortNo> {
        let bits = self.0;
        (0..PORT_MAX).filter(move |port| bits & (1u128 << port) != 0)
    }
}

impl std::ops::BitOr for PortSet {
    type Output = PortSet;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PortSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for PortSet {
    type Output = PortSet;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl std::ops::BitAndAssign for PortSet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl std::ops::Not for PortSet {
    type Output = PortSet;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl std::ops::Sub for PortSet {
    type Output = PortSet;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl FromIterator<PortNo> for PortSet {
    fn from_iter<I: IntoIterator<Item = PortNo>>(iter: I) -> Self {
        let mut set = Self::empty();
        for port in iter {
            set.insert(port);
        }
        set
    }
}

impl std::fmt::Display for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ports: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "{{{}}}", ports.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let a: PortSet = [1, 3, 5].into_iter().collect();
        let b: PortSet = [3, 4].into_iter().collect();
        assert_eq!((a | b).len(), 4);
        assert_eq!(a & b, PortSet::single(3));
        assert_eq!(a - b, [1, 5].into_iter().collect());
        assert_eq!((!a & PortSet::all(6)), [0, 2, 4].into_iter().collect());
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(PortSet::all(128).len(), 128);
        assert_eq!(format!("{}", a), "{1,3,5}");
    }
}
