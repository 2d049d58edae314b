//! Become a member of a group, creating it if there are no active members.
//!
//! Joining is the first half of a rebalance. Every member sends the
//! topics it subscribes to, the coordinator picks one member as leader
//! and hands it everybody's subscription. The leader computes the
//! assignment and distributes it through
//! [`sync_group`](crate::protocol::sync_group).
//!
//! The group API carries subscriptions and assignments as opaque bytes.
//! This client uses the embedded schema of the reference consumer so that
//! other tooling can read its groups.

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
        let b = [
            0, 8, 66, 105, 103, 32, 68, 111, 103, 115, 0, 0, 39, 16, 0, 0, 39, 16, 0, 0, 0, 8, 99,
            111, 110, 115, 117, 109, 101, 114, 0, 0, 0, 1, 0, 5, 114, 97, 110, 103, 101, 0, 0, 0,
            21, 0, 0, 0, 0, 0, 1, 0, 9, 112, 117, 114, 99, 104, 97, 115, 101, 115, 255, 255, 255,
            255,
        ];

        let protocol = request::Protocol::new("range", vec!["purchases".to_owned()]);
        let req = request::JoinGroupRequest::new("Big Dogs", 10000, 10000, "", vec![protocol]);

        let mut buffer: Vec<u8> = vec![];
        req.encode(&mut buffer).unwrap();
        assert_eq!(buffer, b);
    }

    #[test]
    fn parse_leader() {
        let subscription: &[u8] = &[0, 0, 0, 0, 0, 1, 0, 1, b't', 255, 255, 255, 255];
        let mut b: Vec<u8> = vec![
            0, 0, 0, 0, 0, 0, 0, 0, 0, 3, // throttle, error, generation 3
            0, 5, b'r', b'a', b'n', b'g', b'e', //
            0, 2, b'm', b'1', 0, 2, b'm', b'1', // leader and self
            0, 0, 0, 1, 0, 2, b'm', b'1', 0, 0, 0, 13,
        ];
        b.extend_from_slice(subscription);

        let x = response::parse_join_group_response(NomBytes::new(Bytes::from(b)))
            .unwrap()
            .1;

        assert_eq!(x.error_code, KafkaCode::None);
        assert_eq!(x.generation_id, 3);
        assert_eq!(x.protocol_name, "range");
        assert!(x.is_leader());
        let sub = x.members[0].subscription().unwrap();
        assert_eq!(sub.topics, vec!["t".to_owned()]);
        assert_eq!(sub.user_data, None);
    }

    #[test]
    fn parse_follower() {
        let b = b"\0\0\0\0\0\0\0\0\0\x04\0\x05range\0\x02m1\0\x02m2\0\0\0\0";
        let x = response::JoinGroupResponse::try_from(Bytes::from_static(b)).unwrap();
        assert!(!x.is_leader());
        assert!(x.members.is_empty());
    }

    #[test]
    fn parse_member_id_required() {
        let b = b"\0\0\0\0\0\x4f\xff\xff\xff\xff\0\0\0\0\0\x02m9\0\0\0\0";
        let x = response::JoinGroupResponse::try_from(Bytes::from_static(b)).unwrap();
        assert_eq!(x.error_code, KafkaCode::MemberIdRequired);
        assert_eq!(x.member_id, "m9");
    }
}
