use std::fmt;

/// The kind tag carried by every resource handle.
///
/// The string form is what `type_of` reports and what the debug rendering
/// of a handle starts with, e.g. `"file (0x55d0c5e3a2b0)"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceKind {
    /// An opened file
    File,
    /// A TCP or UDP socket
    Socket,
    /// An opened directory
    Directory,
    /// A child process
    Process,
    /// One end of a pipe or a standard stream
    Pipe,
    /// An operating system thread
    Thread,
    /// A fixed capacity queue between threads
    ThreadQueue,
    /// A shared memory segment
    SharedMemory,
    /// A socket readiness set
    Pollset,
    /// An XML parser (external collaborator)
    XmlParser,
    /// A DBM database (external collaborator)
    Dbm,
    /// A database driver (external collaborator)
    DatabaseDriver,
    /// A prepared statement (external collaborator)
    PreparedStatement,
    /// A database result set (external collaborator)
    ResultSet,
    /// A memcache client (external collaborator)
    MemcacheClient,
    /// A memcache server (external collaborator)
    MemcacheServer,
    /// An LDAP connection (external collaborator)
    LdapConnection,
}

impl ResourceKind {
    /// All kinds, in declaration order.
    pub const ALL: [ResourceKind; 17] = [
        ResourceKind::File,
        ResourceKind::Socket,
        ResourceKind::Directory,
        ResourceKind::Process,
        ResourceKind::Pipe,
        ResourceKind::Thread,
        ResourceKind::ThreadQueue,
        ResourceKind::SharedMemory,
        ResourceKind::Pollset,
        ResourceKind::XmlParser,
        ResourceKind::Dbm,
        ResourceKind::DatabaseDriver,
        ResourceKind::PreparedStatement,
        ResourceKind::ResultSet,
        ResourceKind::MemcacheClient,
        ResourceKind::MemcacheServer,
        ResourceKind::LdapConnection,
    ];

    /// The tag as reported by `type_of`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::File => "file",
            ResourceKind::Socket => "socket",
            ResourceKind::Directory => "directory",
            ResourceKind::Process => "process",
            ResourceKind::Pipe => "pipe",
            ResourceKind::Thread => "thread",
            ResourceKind::ThreadQueue => "thread queue",
            ResourceKind::SharedMemory => "shared memory",
            ResourceKind::Pollset => "pollset",
            ResourceKind::XmlParser => "xml parser",
            ResourceKind::Dbm => "dbm",
            ResourceKind::DatabaseDriver => "database driver",
            ResourceKind::PreparedStatement => "prepared statement",
            ResourceKind::ResultSet => "result set",
            ResourceKind::MemcacheClient => "memcache client",
            ResourceKind::MemcacheServer => "memcache server",
            ResourceKind::LdapConnection => "LDAP connection",
        }
    }

    /// Parses a tag previously produced by [`ResourceKind::as_str`].
    pub fn from_tag(tag: &str) -> Option<ResourceKind> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_tag(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::SharedMemory.to_string(), "shared memory");
        assert_eq!(ResourceKind::from_tag("poll descriptor set"), None);
    }
}
