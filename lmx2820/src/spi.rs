use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use std::path::Path;

use crate::hal::{Result, Transport};

const READ: u8 = 0x80;

pub fn open<P: AsRef<Path>>(path: P, speed_hz: u32) -> std::io::Result<Spidev> {
    let mut spi = Spidev::open(path)?;
    let options = SpidevOptions::new()
        .bits_per_word(8)
        .max_speed_hz(speed_hz)
        .mode(SpiModeFlags::SPI_MODE_0)
        .build();
    spi.configure(&options)?;
    Ok(spi)
}

// 24-bit frame, MSB first: R/W, 7 address bits, 16 data bits
fn frame(read: bool, addr: u8, value: u16) -> [u8; 3] {
    let [msb, lsb] = value.to_be_bytes();
    let rw = if read { READ } else { 0 };
    [rw | (addr & !READ), msb, lsb]
}

pub struct Spi {
    dev: Spidev,
}

impl Spi {
    pub fn new(dev: Spidev) -> Self {
        Self { dev }
    }

    pub fn open<P: AsRef<Path>>(path: P, speed_hz: u32) -> std::io::Result<Self> {
        Ok(Self::new(open(path, speed_hz)?))
    }
}

impl Transport for Spi {
    fn write(&mut self, addr: u8, value: u16) -> Result<()> {
        let tx = frame(false, addr, value);
        self.dev.transfer(&mut SpidevTransfer::write(&tx))?;
        Ok(())
    }

    // Readback is clocked out on MUXOUT during the data phase of a read frame
    fn read(&mut self, addr: u8) -> Result<u16> {
        let tx = frame(true, addr, 0);
        let mut rx = [0; 3];
        self.dev.transfer(&mut SpidevTransfer::read_write(&tx, &mut rx))?;
        Ok(u16::from_be_bytes([rx[1], rx[2]]))
    }
}

#[test]
fn write_frame() {
    assert_eq!([0x24, 0x00, 0x50], frame(false, 36, 80));
    assert_eq!([0x4E, 0x12, 0x34], frame(false, 78, 0x1234));
}

#[test]
fn read_frame() {
    assert_eq!([0xFA, 0x00, 0x00], frame(true, 122, 0));
    // Address bit 7 is the R/W flag, never part of the address
    assert_eq!([0x7F, 0xFF, 0xFF], frame(false, 0xFF, 0xFFFF));
}
