use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::SpbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferDirection {
    /// Read from the device into the buffer.
    In,
    /// Write the buffer to the device.
    Out,
    /// Full duplex: write the buffer while reading into it.
    Both,
}

bitflags! {
    /// Positional flags, recomputed by the controller every time a set runs.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TransferFlags: u32 {
        /// First transfer of its set. Adapters typically send a start
        /// condition or assert device select here.
        const FIRST = 0x0000_0001;
        /// Last transfer of its set. Adapters typically send a stop
        /// condition or release device select here.
        const LAST = 0x0000_0002;

        const AUTO_MASK = Self::FIRST.bits() | Self::LAST.bits();
    }
}

/// One atomic operation on the bus.
///
/// The transfer owns its buffer. While the hardware works on it, the host
/// adapter owns the transfer and returns it through
/// [`Controller::transfer_completion`](crate::Controller::transfer_completion).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub buffer: Vec<u8>,
    /// Offset into `buffer` where the transfer starts.
    pub offset: usize,
    /// Number of bytes to move.
    pub size: usize,
    /// Delay the adapter waits before starting this transfer.
    pub microsecond_delay: u32,
    pub flags: TransferFlags,
    /// Bytes sent so far, maintained by the adapter.
    pub transmit_size_completed: usize,
    /// Bytes received so far, maintained by the adapter.
    pub receive_size_completed: usize,
}

impl Transfer {
    fn with_buffer(direction: TransferDirection, buffer: Vec<u8>) -> Self {
        let size = buffer.len();
        Self {
            direction,
            buffer,
            offset: 0,
            size,
            microsecond_delay: 0,
            flags: TransferFlags::empty(),
            transmit_size_completed: 0,
            receive_size_completed: 0,
        }
    }

    /// A transfer writing `data` to the device.
    pub fn write(data: impl Into<Vec<u8>>) -> Self {
        Self::with_buffer(TransferDirection::Out, data.into())
    }

    /// A transfer reading `size` bytes from the device.
    pub fn read(size: usize) -> Self {
        Self::with_buffer(TransferDirection::In, vec![0; size])
    }

    /// A full-duplex transfer; received bytes replace `data` in place.
    pub fn exchange(data: impl Into<Vec<u8>>) -> Self {
        Self::with_buffer(TransferDirection::Both, data.into())
    }

    pub fn with_delay(mut self, microseconds: u32) -> Self {
        self.microsecond_delay = microseconds;
        self
    }

    /// The bytes covered by this transfer.
    ///
    /// # Panics
    ///
    /// Panics if `offset` and `size` reach past the end of `buffer`. Sets
    /// holding such a transfer are rejected on submission, so this only
    /// happens when the fields were changed by hand; see
    /// [`is_well_formed`](Self::is_well_formed) and
    /// [`try_data`](Self::try_data).
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.size]
    }

    /// Mutable view of [`data`](Self::data).
    ///
    /// # Panics
    ///
    /// Panics if the transfer is not well formed.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.size]
    }

    /// The bytes covered by this transfer, or `None` if `offset` and `size`
    /// do not fit in `buffer`.
    pub fn try_data(&self) -> Option<&[u8]> {
        let end = self.offset.checked_add(self.size)?;
        self.buffer.get(self.offset..end)
    }

    pub fn is_first(&self) -> bool {
        self.flags.contains(TransferFlags::FIRST)
    }

    pub fn is_last(&self) -> bool {
        self.flags.contains(TransferFlags::LAST)
    }

    /// Whether `offset` and `size` describe a range inside `buffer`.
    pub fn is_well_formed(&self) -> bool {
        self.offset
            .checked_add(self.size)
            .is_some_and(|end| end <= self.buffer.len())
    }
}

pub(crate) type CompletionCallback = Box<dyn FnOnce(TransferSet) + Send>;

/// How the owner learns that its set finished.
pub(crate) enum Completion {
    None,
    Callback(CompletionCallback),
    /// Signal the owning handle's event. Used by synchronous execution.
    Event,
}

/// An ordered group of transfers that runs without interleaving with any
/// other handle's transfers.
///
/// The set moves into the controller on submission and comes back to the
/// owner on completion, either through the callback installed with
/// [`TransferSet::on_complete`] or as the return value of
/// [`Handle::execute_transfer_set`](crate::Handle::execute_transfer_set).
pub struct TransferSet {
    pub transfers: Vec<Transfer>,
    pub(crate) status: Option<Result<(), SpbError>>,
    pub(crate) processed: usize,
    pub(crate) completion: Completion,
}

impl TransferSet {
    pub fn new(transfers: Vec<Transfer>) -> Self {
        Self {
            transfers,
            status: None,
            processed: 0,
            completion: Completion::None,
        }
    }

    /// Install a callback that receives the set once it completes.
    ///
    /// The callback runs on whatever context finished the set, which may be
    /// the adapter's interrupt worker; it must not block.
    pub fn on_complete(
        mut self,
        callback: impl FnOnce(TransferSet) + Send + 'static,
    ) -> Self {
        self.completion = Completion::Callback(Box::new(callback));
        self
    }

    /// Final status, or `None` while the set has not been handled.
    pub fn status(&self) -> Option<Result<(), SpbError>> {
        self.status
    }

    /// Number of transfers the hardware finished, successfully or not.
    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

impl Default for TransferSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl From<Vec<Transfer>> for TransferSet {
    fn from(transfers: Vec<Transfer>) -> Self {
        Self::new(transfers)
    }
}

impl core::fmt::Debug for TransferSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransferSet")
            .field("transfers", &self.transfers)
            .field("status", &self.status)
            .field("processed", &self.processed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_covers_offset_and_size() {
        let mut transfer = Transfer::write([1, 2, 3, 4]);
        transfer.offset = 1;
        transfer.size = 2;

        assert!(transfer.is_well_formed());
        assert_eq!(transfer.data(), &[2, 3]);
        assert_eq!(transfer.try_data(), Some(&[2, 3][..]));

        transfer.data_mut()[0] = 9;
        assert_eq!(transfer.buffer, [1, 9, 3, 4]);
    }

    #[test]
    fn range_past_buffer_is_not_well_formed() {
        let mut transfer = Transfer::read(4);
        transfer.offset = 3;
        transfer.size = 2;
        assert!(!transfer.is_well_formed());
        assert_eq!(transfer.try_data(), None);

        transfer.offset = usize::MAX;
        assert!(!transfer.is_well_formed());
        assert_eq!(transfer.try_data(), None);
    }

    #[test]
    #[should_panic]
    fn data_panics_on_range_past_buffer() {
        let mut transfer = Transfer::read(2);
        transfer.size = 3;
        let _ = transfer.data();
    }
}
