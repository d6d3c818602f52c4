use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize, Derivative)]
#[derivative(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    #[derivative(PartialEq = "ignore")]
    pub(crate) signature: Document,
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use super::ClusterTime;
    use crate::bson::{doc, Timestamp};

    #[test]
    fn ordering_ignores_signature() {
        let earlier = ClusterTime {
            cluster_time: Timestamp {
                time: 100,
                increment: 1,
            },
            signature: doc! { "keyId": 1 },
        };
        let later = ClusterTime {
            cluster_time: Timestamp {
                time: 100,
                increment: 2,
            },
            signature: doc! { "keyId": 2 },
        };
        let later_twin = ClusterTime {
            cluster_time: Timestamp {
                time: 100,
                increment: 2,
            },
            signature: doc! { "keyId": 3 },
        };

        assert!(earlier < later);
        assert_eq!(later, later_twin);
    }
}
