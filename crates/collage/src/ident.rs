use uuid::Uuid;

/// A unique identifier for nodes. The nil UUID is the "no node" sentinel.
pub type NodeId = Uuid;

/// A unique identifier for distributed objects, shared by the master and
/// all of its slave instances. The nil UUID is the "no object" sentinel.
pub type ObjectId = Uuid;

/// A point in an object's history.
///
/// Master versions are a monotonic counter in the low 64 bits. Slave commits
/// are tagged with fresh UUIDs, which have non-zero high bits and therefore
/// never collide with master versions. A few reserved values at the top of
/// the range select a version symbolically rather than concretely.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u128);

impl Version {
    /// No version; the state of an unattached or never-committed object.
    pub const NONE: Version = Version(0);
    /// The first version a master produces.
    pub const FIRST: Version = Version(1);
    /// Selects the oldest version still retained by the master.
    pub const OLDEST: Version = Version(u128::MAX - 3);
    /// Selects whatever versions are currently available, without blocking.
    pub const HEAD: Version = Version(u128::MAX - 2);
    /// Selects exactly the next version, blocking until it is available.
    pub const NEXT: Version = Version(u128::MAX - 1);
    pub const INVALID: Version = Version(u128::MAX);

    /// True for versions naming a concrete point in history, master or
    /// slave-commit, as opposed to the symbolic selectors.
    pub fn is_concrete(&self) -> bool {
        *self != Self::NONE && self.0 < Self::OLDEST.0
    }

    /// True for versions produced by a master commit.
    pub fn is_master(&self) -> bool {
        self.is_concrete() && (self.0 >> 64) == 0
    }

    /// True for versions produced by a slave commit.
    pub fn is_slave_commit(&self) -> bool {
        self.is_concrete() && (self.0 >> 64) != 0
    }

    /// Mint a fresh slave-commit version.
    pub fn new_slave_commit() -> Version {
        Version(Uuid::new_v4().as_u128())
    }

    pub fn next(&self) -> Version {
        debug_assert!(self.is_master() || *self == Self::NONE);
        Version(self.0 + 1)
    }

    /// The low 64 bits, the counter part of a master version.
    pub fn low(&self) -> u64 {
        self.0 as u64
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Version::NONE => f.write_str("NONE"),
            Version::OLDEST => f.write_str("OLDEST"),
            Version::HEAD => f.write_str("HEAD"),
            Version::NEXT => f.write_str("NEXT"),
            Version::INVALID => f.write_str("INVALID"),
            v if v.is_master() => write!(f, "{}", v.low()),
            v => write!(f, "{:032x}", v.0),
        }
    }
}

/// An object identifier paired with a version, describing one point of one
/// object's history. Used as the mapping target of slaves and as the wire
/// form of object references inside data streams.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectVersion {
    pub id: ObjectId,
    pub version: Version,
}

impl ObjectVersion {
    pub const NONE: ObjectVersion = ObjectVersion {
        id: Uuid::nil(),
        version: Version::NONE,
    };

    pub fn new(id: ObjectId, version: Version) -> Self {
        ObjectVersion { id, version }
    }
}

impl std::fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.id, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_classes() {
        assert!(!Version::NONE.is_concrete());
        assert!(Version::FIRST.is_master());
        assert!(!Version::HEAD.is_concrete());
        assert!(!Version::NEXT.is_concrete());
        assert!(!Version::OLDEST.is_concrete());

        let slave = Version::new_slave_commit();
        assert!(slave.is_slave_commit());
        assert!(!slave.is_master());

        assert_eq!(Version::FIRST.next(), Version(2));
    }
}
