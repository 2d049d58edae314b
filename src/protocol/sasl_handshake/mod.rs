//! Agree on a SASL mechanism before authenticating.

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
        let b = [0, 6, 71, 83, 83, 65, 80, 73];
        let req = request::SaslHandshakeRequest::new("GSSAPI");
        let mut buffer: Vec<u8> = vec![];
        req.encode(&mut buffer).unwrap();
        assert_eq!(buffer, b);
    }

    #[test]
    fn parse() {
        let b = b"\0\0\0\0\0\x02\0\x06GSSAPI\0\x05PLAIN";

        let res = response::SaslHandshakeResponse {
            error_code: KafkaCode::None,
            mechanisms: vec!["GSSAPI".to_owned(), "PLAIN".to_owned()],
        };

        let x = response::parse_sasl_handshake_response(NomBytes::new(Bytes::from_static(b)))
            .unwrap()
            .1;

        assert_eq!(res, x);
        assert!(x.supports("GSSAPI"));
    }

    #[test]
    fn parse_unsupported() {
        let b = b"\0\x21\0\0\0\x01\0\x05PLAIN";
        let x = response::SaslHandshakeResponse::try_from(Bytes::from_static(b)).unwrap();
        assert_eq!(x.error_code, KafkaCode::UnsupportedSaslMechanism);
        assert!(!x.supports("GSSAPI"));
    }
}
