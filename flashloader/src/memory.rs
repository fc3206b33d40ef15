use crate::error::Error;

/// {function_name} was called with data length that is not a multiple of {alignment}
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct InvalidDataLengthError {
    /// Name of the function that caused the error.
    pub function_name: &'static str,
    /// The alignment required on the data length.
    pub alignment: usize,
}

impl InvalidDataLengthError {
    pub fn new(function_name: &'static str, alignment: usize) -> Self {
        Self {
            function_name,
            alignment,
        }
    }
}

/// Memory access to address {address:#X?} was not aligned to {alignment} bytes.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct MemoryNotAlignedError {
    /// The address of the access.
    pub address: u64,
    /// The required alignment in bytes (address increments).
    pub alignment: usize,
}

/// An interface to be implemented for drivers that allow target memory access.
///
/// Implementations are expected to allow memory accesses while the core is running.
pub trait MemoryInterface {
    /// Read a 32bit word of at `address`.
    ///
    /// The address where the read should be performed at has to be a multiple of 4.
    fn read_word_32(&mut self, address: u64) -> Result<u32, Error> {
        let mut word = 0;
        self.read_32(address, std::slice::from_mut(&mut word))?;
        Ok(word)
    }

    /// Read an 8bit word of at `address`.
    fn read_word_8(&mut self, address: u64) -> Result<u8, Error> {
        let mut word = 0;
        self.read_8(address, std::slice::from_mut(&mut word))?;
        Ok(word)
    }

    /// Read a block of 32bit words at `address`.
    ///
    /// The number of words read is `data.len()`.
    /// The address where the read should be performed at has to be a multiple of 4.
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), Error>;

    /// Read a block of 8bit words at `address`.
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error>;

    /// Reads bytes using 32 bit memory access.
    ///
    /// Both the address and the length of `data` have to be multiples of 4.
    fn read_mem_32bit(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        if data.len() % 4 != 0 {
            return Err(InvalidDataLengthError::new("read_mem_32bit", 4).into());
        }
        if address % 4 != 0 {
            return Err(MemoryNotAlignedError {
                address,
                alignment: 4,
            }
            .into());
        }

        let mut buffer = vec![0u32; data.len() / 4];
        self.read_32(address, &mut buffer)?;
        for (bytes, value) in data.chunks_exact_mut(4).zip(buffer.iter()) {
            bytes.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Read data from `address`, using the widest access the alignment allows.
    fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        if address % 4 == 0 && data.len() % 4 == 0 {
            self.read_mem_32bit(address, data)
        } else {
            self.read_8(address, data)
        }
    }

    /// Write a 32bit word at `address`.
    ///
    /// The address where the write should be performed at has to be a multiple of 4.
    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), Error> {
        self.write_32(address, std::slice::from_ref(&data))
    }

    /// Write an 8bit word at `address`.
    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), Error> {
        self.write_8(address, std::slice::from_ref(&data))
    }

    /// Write a block of 32bit words at `address`.
    ///
    /// The address where the write should be performed at has to be a multiple of 4.
    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), Error>;

    /// Write a block of 8bit words at `address`.
    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Write data to `address`, using the widest access the alignment allows.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        if address % 4 == 0 && data.len() % 4 == 0 {
            let words: Vec<u32> = data
                .chunks_exact(4)
                .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                .collect();
            self.write_32(address, &words)
        } else {
            self.write_8(address, data)
        }
    }
}
