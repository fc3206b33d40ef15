use super::{FlashError, FlashLayout, MismatchError};
use crate::core::TargetAccess;

/// Largest number of bytes read from the target in one go.
const READ_CHUNK_SIZE: usize = 0x1000;

/// Reads back the memory at `address` and compares it to `expected`.
///
/// Fails with [`FlashError::Verify`] on the first byte that differs. The mismatch
/// offset is relative to `address`.
pub fn verify(
    target: &mut dyn TargetAccess,
    address: u64,
    expected: &[u8],
) -> Result<(), FlashError> {
    match compare(target, address, expected, address)? {
        Some(mismatch) => Err(FlashError::Verify(mismatch)),
        None => Ok(()),
    }
}

/// Compares the image data of `layout` to the flash contents.
///
/// Fills are not compared. Offsets of mismatches are relative to the first image byte.
pub(super) fn verify_layout(
    target: &mut dyn TargetAccess,
    layout: &FlashLayout,
) -> Result<Option<MismatchError>, FlashError> {
    let Some(origin) = layout.image_start() else {
        return Ok(None);
    };

    for (address, data) in layout.image_spans() {
        if let Some(mismatch) = compare(target, address, &data, origin)? {
            return Ok(Some(mismatch));
        }
    }

    Ok(None)
}

fn compare(
    target: &mut dyn TargetAccess,
    address: u64,
    expected: &[u8],
    origin: u64,
) -> Result<Option<MismatchError>, FlashError> {
    let mut actual = vec![0; READ_CHUNK_SIZE.min(expected.len())];

    for (index, expected) in expected.chunks(READ_CHUNK_SIZE).enumerate() {
        let chunk_address = address + (index * READ_CHUNK_SIZE) as u64;
        let actual = &mut actual[..expected.len()];
        target
            .read(chunk_address, actual)
            .map_err(FlashError::Memory)?;

        if let Some(position) = expected.iter().zip(actual.iter()).position(|(e, a)| e != a) {
            let mismatch_address = chunk_address + position as u64;
            tracing::warn!(
                "Flash contents differ at {:#010x}: expected {:#04x}, read {:#04x}",
                mismatch_address,
                expected[position],
                actual[position]
            );
            return Ok(Some(MismatchError {
                address: mismatch_address,
                offset: mismatch_address - origin,
                expected: expected[position],
                actual: actual[position],
            }));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::fake_target::FakeTarget;
    use pretty_assertions::assert_eq;

    fn target() -> FakeTarget {
        FakeTarget::new(vec![0x2000_0000..0x2001_0000]).with_flash(0x0800_0000..0x0800_4000, 0xff)
    }

    #[test]
    fn identical_contents_pass() {
        let mut target = target();
        let data: Vec<u8> = (0..0x1800u32).map(|i| i as u8).collect();
        target.set_flash(0x0800_0100, &data);

        verify(&mut target, 0x0800_0100, &data).unwrap();
    }

    #[test]
    fn first_difference_is_reported() {
        let mut target = target();
        let data: Vec<u8> = vec![0x11; 0x2000];
        target.set_flash(0x0800_0000, &data);
        target.set_flash(0x0800_1234, &[0x10]);
        target.set_flash(0x0800_1300, &[0x00]);

        let error = verify(&mut target, 0x0800_0000, &data).unwrap_err();

        match error {
            FlashError::Verify(mismatch) => assert_eq!(
                mismatch,
                MismatchError {
                    address: 0x0800_1234,
                    offset: 0x1234,
                    expected: 0x11,
                    actual: 0x10,
                }
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unaligned_ranges_are_read_bytewise() {
        let mut target = target();
        target.set_flash(0x0800_0003, &[1, 2, 3]);

        verify(&mut target, 0x0800_0003, &[1, 2, 3]).unwrap();
        assert!(verify(&mut target, 0x0800_0003, &[1, 2, 4]).is_err());
    }

    #[test]
    fn unreadable_memory_is_a_transport_error() {
        let mut target = target();

        let error = verify(&mut target, 0x0900_0000, &[0; 4]).unwrap_err();
        assert!(matches!(error, FlashError::Memory(_)));
    }
}
