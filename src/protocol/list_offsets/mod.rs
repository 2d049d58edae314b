//! Look up offsets by timestamp, or the earliest and latest of a partition.

pub mod request;
pub mod response;

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use nombytes::NomBytes;

    use super::*;
    use crate::{encode::ToByte, error::KafkaCode};

    #[test]
    fn encode() {
        let mut req = request::ListOffsetsRequest::new();
        req.add("t", 0, request::EARLIEST_TIMESTAMP);
        req.add("t", 1, request::LATEST_TIMESTAMP);
        let mut buffer: Vec<u8> = vec![];
        req.encode(&mut buffer).unwrap();
        assert_eq!(
            buffer,
            [
                0xff, 0xff, 0xff, 0xff, // replica
                0, 0, 0, 1, 0, 1, b't', 0, 0, 0, 2, //
                0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe, //
                0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            ]
        );
    }

    #[test]
    fn parse() {
        let b: &[u8] = &[
            0, 0, 0, 1, 0, 1, b't', 0, 0, 0, 1, //
            0, 0, 0, 0, 0, 0, // partition, error
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // timestamp
            0, 0, 0, 0, 0, 0, 0, 9, // offset
        ];
        let x = response::parse_list_offsets_response(NomBytes::new(Bytes::copy_from_slice(b)))
            .unwrap()
            .1;
        let p = &x.topics[0].partitions[0];
        assert_eq!(p.error_code, KafkaCode::None);
        assert_eq!(p.offset, 9);
        assert_eq!(x.offset("t", 0), Some(9));
        assert_eq!(x.offset("t", 1), None);
    }
}
