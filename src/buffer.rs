//! Lays out the data phase of one submission.
//!
//! OUT data is handed to the provider in place when it already meets the
//! transport's alignment. Anything the device writes into is staged, and only
//! copied back into the caller's buffer once the command has succeeded, so a
//! failed or abandoned attempt never leaves partial data behind.

use crate::context::{DataBuffer, DataDirection};
use crate::error::BufferError;
use crate::io::IoData;
use crate::profile::DeviceProfile;
use crate::transport::{Payload, TransportDescriptor, WireCommand};

/// Effective limits for one (profile, transport) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_transfer: usize,
    pub alignment: usize,
}

impl BufferLimits {
    /// The stricter of the adapter's limits and the dialect's own.
    pub fn for_transport(profile: &DeviceProfile, descriptor: &TransportDescriptor) -> Self {
        let max_transfer = descriptor
            .features
            .max_transfer
            .map_or(profile.max_transfer(), |max| max.min(profile.max_transfer()));
        Self {
            max_transfer,
            alignment: profile.alignment().max(descriptor.features.alignment).max(1),
        }
    }
}

fn is_aligned(buf: &[u8], alignment: usize) -> bool {
    (buf.as_ptr() as usize) % alignment == 0
}

/// Heap buffer whose usable region starts on an `alignment` boundary.
pub struct AlignedBuffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    pub fn zeroed(len: usize, alignment: usize) -> Result<Self, BufferError> {
        let alignment = alignment.max(1);
        let capacity = len
            .checked_add(alignment - 1)
            .ok_or(BufferError::Alloc { len })?;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| BufferError::Alloc { len })?;
        storage.resize(capacity, 0);
        let address = storage.as_ptr() as usize;
        let offset = (alignment - address % alignment) % alignment;
        Ok(Self {
            storage,
            offset,
            len,
        })
    }

    pub fn copy_from(data: &[u8], alignment: usize) -> Result<Self, BufferError> {
        let mut buffer = Self::zeroed(data.len(), alignment)?;
        buffer.as_mut_slice().copy_from_slice(data);
        Ok(buffer)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The data phase, ready to hand to the provider.
pub enum PreparedBuffer<'b> {
    Empty,
    /// Caller or translator bytes used in place.
    Direct(&'b [u8]),
    Staged {
        staging: AlignedBuffer,
        direction: DataDirection,
        /// Caller region filled on a successful commit.
        copy_back: Option<&'b mut [u8]>,
    },
}

impl PreparedBuffer<'_> {
    pub fn as_io(&mut self) -> IoData<'_> {
        match self {
            PreparedBuffer::Empty => IoData::None,
            PreparedBuffer::Direct(buf) => IoData::Out(buf),
            PreparedBuffer::Staged {
                staging, direction, ..
            } => match direction {
                DataDirection::None => IoData::None,
                DataDirection::Out => IoData::Out(staging.as_slice()),
                DataDirection::In => IoData::In(staging.as_mut_slice()),
                DataDirection::Bidirectional => IoData::Bidirectional(staging.as_mut_slice()),
            },
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, PreparedBuffer::Staged { .. })
    }

    /// Finishes the attempt. Device-written bytes reach the caller only when
    /// `succeeded`; returns how many were copied.
    pub fn commit(self, succeeded: bool, transferred: usize) -> usize {
        match self {
            PreparedBuffer::Staged {
                staging,
                copy_back: Some(dst),
                ..
            } if succeeded => {
                let n = transferred.min(staging.len()).min(dst.len());
                dst[..n].copy_from_slice(&staging.as_slice()[..n]);
                n
            }
            _ => 0,
        }
    }
}

/// Lays out the data phase of `command` against the caller's `data`.
pub fn prepare<'b>(
    limits: &BufferLimits,
    data: &'b mut DataBuffer<'_>,
    command: &'b WireCommand,
) -> Result<PreparedBuffer<'b>, BufferError> {
    let need = command.transfer_len;
    if need > limits.max_transfer {
        return Err(BufferError::TooLarge {
            len: need,
            max: limits.max_transfer,
        });
    }

    match &command.payload {
        Payload::None => Ok(PreparedBuffer::Empty),
        Payload::Generated(bytes) => outgoing(limits, &bytes[..need.min(bytes.len())]),
        Payload::Caller if need == 0 => Ok(PreparedBuffer::Empty),
        Payload::Caller => {
            let have = data.len();
            if have < need {
                return Err(BufferError::Short { have, need });
            }
            match data {
                DataBuffer::None => Err(BufferError::Short { have: 0, need }),
                DataBuffer::Out(buf) => outgoing(limits, &buf[..need]),
                DataBuffer::In(buf) => Ok(PreparedBuffer::Staged {
                    staging: AlignedBuffer::zeroed(need, limits.alignment)?,
                    direction: DataDirection::In,
                    copy_back: Some(&mut buf[..need]),
                }),
                DataBuffer::Bidirectional(buf) => Ok(PreparedBuffer::Staged {
                    staging: AlignedBuffer::copy_from(&buf[..need], limits.alignment)?,
                    direction: DataDirection::Bidirectional,
                    copy_back: Some(&mut buf[..need]),
                }),
            }
        }
    }
}

fn outgoing<'b>(limits: &BufferLimits, bytes: &'b [u8]) -> Result<PreparedBuffer<'b>, BufferError> {
    if is_aligned(bytes, limits.alignment) {
        Ok(PreparedBuffer::Direct(bytes))
    } else {
        Ok(PreparedBuffer::Staged {
            staging: AlignedBuffer::copy_from(bytes, limits.alignment)?,
            direction: DataDirection::Out,
            copy_back: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ata::TaskFile;
    use crate::transport::{ReverseMapping, WireRequest};

    fn limits(alignment: usize) -> BufferLimits {
        BufferLimits {
            max_transfer: 4096,
            alignment,
        }
    }

    fn command(direction: DataDirection, payload: Payload, transfer_len: usize) -> WireCommand {
        WireCommand {
            request: WireRequest::Ata(TaskFile::read_sectors(0, 1)),
            direction,
            payload,
            transfer_len,
            rule: None,
            reverse: ReverseMapping::Status,
        }
    }

    #[test]
    fn aligned_buffer_is_aligned() {
        for alignment in [1, 8, 512, 4096] {
            let buf = AlignedBuffer::zeroed(100, alignment).expect("small allocation");
            assert_eq!(buf.len(), 100);
            assert!(is_aligned(buf.as_slice(), alignment));
        }
    }

    #[test]
    fn aligned_out_data_is_used_in_place() {
        let backing = AlignedBuffer::copy_from(&[7u8; 513], 64).expect("allocation");
        let mut data = DataBuffer::Out(&backing.as_slice()[..512]);
        let cmd = command(DataDirection::Out, Payload::Caller, 512);
        let prepared = prepare(&limits(64), &mut data, &cmd).expect("fits");
        assert!(matches!(prepared, PreparedBuffer::Direct(b) if b.len() == 512));
    }

    #[test]
    fn misaligned_out_data_is_staged() {
        let backing = AlignedBuffer::copy_from(&[7u8; 513], 64).expect("allocation");
        let mut data = DataBuffer::Out(&backing.as_slice()[1..]);
        let cmd = command(DataDirection::Out, Payload::Caller, 512);
        let mut prepared = prepare(&limits(64), &mut data, &cmd).expect("fits");
        assert!(prepared.is_staged());
        match prepared.as_io() {
            IoData::Out(bytes) => {
                assert!(is_aligned(bytes, 64));
                assert!(bytes.iter().all(|b| *b == 7));
            }
            other => panic!("expected OUT data, got {other:?}"),
        }
    }

    #[test]
    fn in_data_reaches_the_caller_only_on_success() {
        let mut caller = [0xEEu8; 16];
        let cmd = command(DataDirection::In, Payload::Caller, 16);

        let mut data = DataBuffer::In(&mut caller);
        let mut prepared = prepare(&limits(1), &mut data, &cmd).expect("fits");
        if let IoData::In(bytes) = prepared.as_io() {
            bytes.fill(0x11);
        }
        assert_eq!(prepared.commit(false, 16), 0);
        assert_eq!(caller, [0xEE; 16]);

        let mut data = DataBuffer::In(&mut caller);
        let mut prepared = prepare(&limits(1), &mut data, &cmd).expect("fits");
        if let IoData::In(bytes) = prepared.as_io() {
            bytes.fill(0x11);
        }
        assert_eq!(prepared.commit(true, 8), 8);
        assert_eq!(&caller[..8], &[0x11; 8]);
        assert_eq!(&caller[8..], &[0xEE; 8]);
    }

    #[test]
    fn oversized_and_short_transfers_are_rejected() {
        let mut caller = [0u8; 8192];
        let mut data = DataBuffer::In(&mut caller);
        let cmd = command(DataDirection::In, Payload::Caller, 8192);
        assert_eq!(
            prepare(&limits(1), &mut data, &cmd).err(),
            Some(BufferError::TooLarge {
                len: 8192,
                max: 4096
            })
        );

        let mut small = [0u8; 10];
        let mut data = DataBuffer::In(&mut small);
        let cmd = command(DataDirection::In, Payload::Caller, 512);
        assert_eq!(
            prepare(&limits(1), &mut data, &cmd).err(),
            Some(BufferError::Short { have: 10, need: 512 })
        );
    }

    #[test]
    fn generated_payload_ignores_the_caller_buffer() {
        let mut data = DataBuffer::None;
        let cmd = command(DataDirection::Out, Payload::Generated(vec![1, 2, 3, 4]), 4);
        let mut prepared = prepare(&limits(1), &mut data, &cmd).expect("fits");
        assert!(matches!(prepared.as_io(), IoData::Out(&[1, 2, 3, 4])));
    }
}
