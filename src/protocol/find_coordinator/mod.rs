//! Locate the current coordinator of a group.

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
        let b = [0, 8, 66, 105, 103, 32, 68, 111, 103, 115];
        let req = request::FindCoordinatorRequest::new("Big Dogs");
        let mut buffer: Vec<u8> = vec![];
        req.encode(&mut buffer).unwrap();
        assert_eq!(buffer, b);
    }

    #[test]
    fn parse() {
        let b = b"\0\0\0\0\0\x01\0\tlocalhost\0\0#\x84";

        let res = response::FindCoordinatorResponse {
            error_code: KafkaCode::None,
            node_id: 1,
            host: "localhost".to_owned(),
            port: 9092,
        };

        let x = response::parse_find_coordinator_response(NomBytes::new(Bytes::from_static(b)))
            .unwrap()
            .1;

        assert_eq!(res, x);
    }

    #[test]
    fn parse_not_available() {
        let b = b"\0\x0f\xff\xff\xff\xff\0\0\xff\xff\xff\xff";
        let x = response::FindCoordinatorResponse::try_from(Bytes::from_static(b)).unwrap();
        assert_eq!(x.error_code, KafkaCode::GroupCoordinatorNotAvailable);
        assert_eq!(x.node_id, -1);
    }
}
