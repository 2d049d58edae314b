//! Store consumed positions with the group coordinator.

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
        let mut req = request::OffsetCommitRequest::new("g", 4, "m");
        req.add("t", 2, 100, None);
        let mut buffer: Vec<u8> = vec![];
        req.encode(&mut buffer).unwrap();
        assert_eq!(
            buffer,
            [
                0, 1, b'g', 0, 0, 0, 4, 0, 1, b'm', //
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // broker retention
                0, 0, 0, 1, 0, 1, b't', 0, 0, 0, 1, //
                0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 100, 0xff, 0xff,
            ]
        );
    }

    #[test]
    fn parse() {
        let b: &[u8] = &[0, 0, 0, 1, 0, 1, b't', 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0x16];
        let x = response::parse_offset_commit_response(NomBytes::new(Bytes::copy_from_slice(b)))
            .unwrap()
            .1;
        assert_eq!(x.topics[0].partitions[0].error_code, KafkaCode::None);
        assert_eq!(
            x.first_error(),
            Some(("t", 1, KafkaCode::IllegalGeneration))
        );
    }
}
