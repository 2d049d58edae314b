//! Distribute the leader's partition assignment to every member.

pub mod request;
pub mod response;

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use nombytes::NomBytes;

    use super::*;
    use crate::{encode::ToByte, error::KafkaCode};

    fn assignment() -> request::MemberAssignment {
        request::MemberAssignment::new(vec![request::PartitionAssignment::new(
            "purchases",
            vec![0, 1],
        )])
    }

    #[test]
    fn encode() {
        let b = [
            0, 8, 66, 105, 103, 32, 68, 111, 103, 115, 0, 0, 0, 1, 0, 2, 109, 49, 0, 0, 0, 1, 0, 2,
            109, 49, 0, 0, 0, 33, 0, 0, 0, 0, 0, 1, 0, 9, 112, 117, 114, 99, 104, 97, 115, 101,
            115, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1, 255, 255, 255, 255,
        ];

        let req = request::SyncGroupRequest::new(
            "Big Dogs",
            1,
            "m1",
            vec![request::Assignment::new("m1", assignment())],
        );
        let mut buffer: Vec<u8> = vec![];
        req.encode(&mut buffer).unwrap();
        assert_eq!(buffer, b);
    }

    #[test]
    fn parse() {
        let mut b: Vec<u8> = vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 33];
        assignment().encode_inner(&mut b).unwrap();

        let x = response::parse_sync_group_response(NomBytes::new(Bytes::from(b)))
            .unwrap()
            .1;
        assert_eq!(x.error_code, KafkaCode::None);
        assert_eq!(x.assignment, assignment());
        assert_eq!(
            x.assignment.topic_partitions(),
            vec![("purchases".to_owned(), 0), ("purchases".to_owned(), 1)]
        );
    }

    #[test]
    fn parse_empty_assignment() {
        let b = b"\0\0\0\0\0\0\0\0\0\0";
        let x = response::SyncGroupResponse::try_from(Bytes::from_static(b)).unwrap();
        assert!(x.assignment.partition_assignments.is_empty());
    }

    #[test]
    fn parse_rebalancing() {
        let b = b"\0\0\0\0\0\x1b\0\0\0\0";
        let x = response::SyncGroupResponse::try_from(Bytes::from_static(b)).unwrap();
        assert_eq!(x.error_code, KafkaCode::RebalanceInProgress);
    }
}
