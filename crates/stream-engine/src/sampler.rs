//! Per-Tick Sampling

use crate::config::ChannelDescriptor;
use bus_manager::BusManager;
use ring_buffer::{Record, RecordStatus};
use shuttle_protocol::limits::TIMESTAMP_MASK;
use tracing::warn;

/// Read every block of a channel and format one record
///
/// A failing block aborts the sample; the record then carries the failure's
/// status code and no data so the host sees the gap instead of stale bytes.
pub(crate) fn sample(buses: &mut BusManager, descriptor: &ChannelDescriptor, timestamp_us: u64) -> Record {
    let mut data = vec![0u8; descriptor.sample_bytes()];
    let mut status = RecordStatus::Ok;
    let mut offset = 0;

    for block in &descriptor.blocks {
        let end = offset + usize::from(block.byte_count);
        if let Err(e) = buses.read_block(descriptor.config.target, block.start_register, &mut data[offset..end]) {
            warn!(
                "Channel {} read of register {:#04X} failed: {}",
                descriptor.channel_id, block.start_register, e
            );
            status = RecordStatus::BusError(e.code().as_i16());
            data.clear();
            break;
        }
        offset = end;
    }

    Record {
        channel_id: descriptor.channel_id,
        status,
        timestamp_us: descriptor.config.timestamp.then_some(timestamp_us & TIMESTAMP_MASK),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Block, StreamingConfig};
    use bus_manager::{MockBus, SensorTarget};
    use shuttle_protocol::{ErrorCode, I2cBus, I2cMode, SamplingUnit};

    const ACCEL: SensorTarget = SensorTarget::I2c { bus: I2cBus::Bus0, address: 0x18 };

    fn setup() -> (MockBus, BusManager) {
        let mock = MockBus::new();
        mock.add_device(ACCEL);
        let mut buses = BusManager::new(Box::new(mock.clone()));
        buses.config_i2c_bus(I2cBus::Bus0, I2cMode::Fast).unwrap();
        (mock, buses)
    }

    fn descriptor(blocks: &[Block], timestamp: bool) -> ChannelDescriptor {
        let config = StreamingConfig {
            target: ACCEL,
            sampling_time: 10,
            sampling_unit: SamplingUnit::Milliseconds,
            interrupt: None,
            timestamp,
        };
        ChannelDescriptor::new(2, config, blocks).unwrap()
    }

    #[test]
    fn test_blocks_concatenate_in_order() {
        let (mock, mut buses) = setup();
        mock.set_registers(ACCEL, 0x00, &[0x11, 0x22]);
        mock.set_registers(ACCEL, 0x40, &[0xAA, 0xBB, 0xCC]);

        let desc = descriptor(&[Block::new(0x40, 3), Block::new(0x00, 2)], false);
        let record = sample(&mut buses, &desc, 1234);

        assert!(record.is_ok());
        assert_eq!(record.channel_id, 2);
        assert_eq!(record.timestamp_us, None);
        assert_eq!(record.data, vec![0xAA, 0xBB, 0xCC, 0x11, 0x22]);
    }

    #[test]
    fn test_timestamp_truncated_to_48_bits() {
        let (_mock, mut buses) = setup();
        let desc = descriptor(&[Block::new(0x00, 1)], true);
        let record = sample(&mut buses, &desc, (1u64 << 48) + 7);
        assert_eq!(record.timestamp_us, Some(7));
    }

    #[test]
    fn test_nack_yields_error_record() {
        let (mock, mut buses) = setup();
        mock.set_nack(ACCEL, true);

        let desc = descriptor(&[Block::new(0x00, 2)], true);
        let record = sample(&mut buses, &desc, 500);

        assert_eq!(record.status, RecordStatus::BusError(ErrorCode::DeviceNotFound.as_i16()));
        assert!(record.data.is_empty());
        assert_eq!(record.timestamp_us, Some(500));
    }
}
