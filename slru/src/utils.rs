pub(crate) const B: usize = 1;
pub(crate) const KIB: usize = 1024 * B;
