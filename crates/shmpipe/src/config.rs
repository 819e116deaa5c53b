/// Which side of the pipe a handle was opened as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

/// Which side offers the shared pages and grants the other access to them.
/// spec.md's original handshake only describes the writer offering; this
/// makes the direction a first-class, symmetric choice instead (resolves
/// the Open Question on receiver-offers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    WriterOffers,
    ReaderOffers,
}

#[derive(Debug, Clone, Copy)]
pub struct PipeConfig {
    pub pages: u8,
    pub role: Role,
    pub convention: Convention,
    /// Bulk-transfer chunk size for `read_all`/`write_all`. Defaults to
    /// `B / 4` once the ring's capacity is known (spec.md §4.2); set
    /// explicitly to override.
    pub granularity: Option<usize>,
    /// Bounded busy-spin iterations before falling back to WAITING/SLEEPING
    /// and a blocking AWAIT.
    pub spin_iterations: u32,
}

impl PipeConfig {
    pub fn new(pages: u8, role: Role) -> Self {
        Self {
            pages,
            role,
            convention: Convention::WriterOffers,
            granularity: None,
            spin_iterations: 256,
        }
    }

    pub fn convention(mut self, convention: Convention) -> Self {
        self.convention = convention;
        self
    }

    pub fn granularity(mut self, bytes: usize) -> Self {
        self.granularity = Some(bytes);
        self
    }

    pub fn spin_iterations(mut self, n: u32) -> Self {
        self.spin_iterations = n;
        self
    }
}
