//! Tests for the public API surface
//!
//! These tests exercise configuration, values and descriptors without a
//! running server.

use bytes::Bytes;
use rowproto::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_FIELD_CAPACITY, DEFAULT_PIECE_SIZE};
use rowproto::{
    CancelPolicy, CancelScope, ChunkedTransfer, Config, DataFormat, DataType, Descriptor, Error,
    FieldBuffer, FieldTarget, Value,
};

mod config_tests {
    use super::*;

    #[test]
    fn test_config_from_connection_string() {
        let config: Config = "sa:secret@getsend_srv".parse().unwrap();
        assert_eq!(config.server_name, "getsend_srv");
        assert_eq!(config.username, "sa");
        assert_eq!(config.to_string(), "sa@getsend_srv");
    }

    #[test]
    fn test_config_defaults_match_transfer_defaults() {
        let config = Config::new("srv", "sa", "");
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.send_piece_size, DEFAULT_PIECE_SIZE);
        assert_eq!(config.field_capacity, DEFAULT_FIELD_CAPACITY);

        let transfer = ChunkedTransfer::from_config(&config).unwrap();
        assert_eq!(transfer.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(transfer.piece_size(), DEFAULT_PIECE_SIZE);
    }

    #[test]
    fn test_config_cancel_policy() {
        let config = Config::new("srv", "sa", "").cancel_policy(CancelPolicy {
            on_status: CancelScope::All,
            on_unclassified: CancelScope::Current,
        });
        assert_eq!(config.cancel_policy.on_status, CancelScope::All);
        assert_eq!(
            CancelPolicy::default(),
            CancelPolicy {
                on_status: CancelScope::Current,
                on_unclassified: CancelScope::All,
            }
        );
    }

    #[test]
    fn test_invalid_connection_string() {
        assert!(matches!(
            "@srv".parse::<Config>(),
            Err(Error::InvalidConnectionString(_))
        ));
    }
}

mod value_tests {
    use super::*;

    #[test]
    fn test_numbers_decode_from_big_endian() {
        let bytes = Value::Float(20.3).to_bytes();
        assert_eq!(
            Value::from_bytes(DataType::Float, &bytes).unwrap(),
            Value::Float(20.3)
        );
        assert_eq!(Value::from_bytes(DataType::Int, &[]).unwrap(), Value::Null);
        assert!(Value::from_bytes(DataType::Int, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_large_types() {
        assert!(DataType::Text.is_large());
        assert!(DataType::Image.is_large());
        assert!(!DataType::Binary.is_large());
        assert!(Value::Text(Bytes::from_static(b"x")).fits(DataType::Text));
        assert!(!Value::Integer(1).fits(DataType::Text));
    }

    #[test]
    fn test_timestamp_format() {
        let format = DataFormat::new("txts", DataType::Binary)
            .with_status(rowproto::constants::format_status::TIMESTAMP);
        assert!(format.is_timestamp());
        assert!(!DataFormat::new("t", DataType::Binary).is_timestamp());
    }
}

mod descriptor_tests {
    use super::*;

    #[test]
    fn test_uninitialized_descriptor() {
        let descriptor = Descriptor::new(Bytes::new(), Bytes::new(), 0);
        assert!(!descriptor.is_initialized());
    }

    #[test]
    fn test_descriptor_hex() {
        let descriptor = Descriptor::new(
            Bytes::from_static(&[0xab, 0x01]),
            Bytes::from_static(&[0, 0, 0, 2]),
            4,
        );
        assert!(descriptor.is_initialized());
        assert_eq!(descriptor.location_hex(), "ab01");
        assert_eq!(descriptor.version_hex(), "00000002");
    }

    #[test]
    fn test_field_buffer_bounds() {
        let mut buffer = FieldBuffer::new(4);
        buffer.append(b"abc").unwrap();
        assert_eq!(buffer.remaining(), 1);
        assert!(buffer.append(b"de").is_err());
        assert!(buffer.matches(b"abc"));
    }

    #[test]
    fn test_target_order() {
        assert!(FieldTarget::new("texttab", 0, 1).is_ok());
        assert!(FieldTarget::new("texttab", 1, 0).is_err());
        assert!(FieldTarget::new("texttab", 0, 1)
            .unwrap()
            .with_trailing(&[1])
            .is_err());
    }
}
