use bitflags::bitflags;

bitflags! {
    /// Page permission bits currently granted to a range of guest pages.
    ///
    /// `!flags` truncates to the defined bits, so "everything except write"
    /// is simply `!AccessFlags::WRITE`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}
