#[cfg(feature = "arbitrary")]
mod fuzz {
    use arbitrary::{Arbitrary, Unstructured};
    use asset_graph::{
        decode_envelope, encode_envelope, AssetData, FieldIndex, Record, StorageError, Value,
        DATA_BINARY_MAGIC, DATA_FORMAT_VERSION,
    };

    fn fill_deterministic(buf: &mut [u8], seed: u64) {
        let mut state = seed;
        for byte in buf.iter_mut() {
            // xorshift64*
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            state = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
            *byte = (state & 0xFF) as u8;
        }
    }

    /// Valid header around an arbitrary payload, so decoding reaches postcard.
    fn wrap(payload: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(14 + payload.len());
        output.extend_from_slice(&DATA_BINARY_MAGIC);
        output.extend_from_slice(&DATA_FORMAT_VERSION.to_le_bytes());
        output.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        output.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        output.extend_from_slice(payload);
        output
    }

    #[test]
    fn fuzz_decode_random_blobs() {
        let mut raw = [0u8; 4096];
        for i in 0..256u64 {
            fill_deterministic(&mut raw, 0xB10B_u64 ^ i);
            let len = (i as usize * 17) % raw.len();
            let bytes = &raw[..len];

            // Arbitrary bytes never get past the header checks.
            assert!(decode_envelope::<AssetData>(bytes).is_err());

            // With a valid header the payload decoder must fail cleanly or
            // produce a value that encodes again.
            match decode_envelope::<AssetData>(&wrap(bytes)) {
                Ok(data) => {
                    encode_envelope(&data).expect("decoded data should re-encode");
                }
                Err(err) => assert!(
                    matches!(err, StorageError::Serialization(_)),
                    "unexpected error: {err}"
                ),
            }
        }
    }

    #[test]
    fn fuzz_values_roundtrip_bitwise() {
        let mut raw = [0u8; 1024 * 16];
        for i in 0..128u64 {
            fill_deterministic(&mut raw, 0xC0DE_C0DE_u64 ^ i);
            let mut u = Unstructured::new(&raw);
            let Ok(value) = Value::arbitrary(&mut u) else {
                continue;
            };
            let Ok(field) = FieldIndex::arbitrary(&mut u) else {
                continue;
            };
            let record = Record::new("fuzz.value", 1).with(field.raw(), value.clone());
            let bytes = encode_envelope(&record).expect("record should encode");
            let decoded: Record = decode_envelope(&bytes).expect("record should decode");
            assert_eq!(decoded, record, "seed {i}");
        }
    }
}
