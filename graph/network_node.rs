/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use crate::model::{InitiatorType, NetworkRequest, ResourcePriority, ResourceType};

/// Graph payload for a single network request.
///
/// The record is shared between a graph and its clones; writes go through
/// `record_mut`, which copies it first if another graph still holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkNode {
    record: Arc<NetworkRequest>,
}

impl NetworkNode {
    pub fn new(record: NetworkRequest) -> Self {
        Self {
            record: Arc::new(record),
        }
    }

    pub fn record(&self) -> &NetworkRequest {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut NetworkRequest {
        Arc::make_mut(&mut self.record)
    }

    /// True when this node and `other` point at the same underlying record.
    pub fn shares_record_with(&self, other: &NetworkNode) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }

    pub fn set_transfer_size(&mut self, bytes: u64) {
        if self.record.transfer_size != bytes {
            self.record_mut().transfer_size = bytes;
        }
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        self.record.resource_type
    }

    pub fn initiator_type(&self) -> InitiatorType {
        self.record.initiator.initiator_type
    }

    pub fn is_script(&self) -> bool {
        self.resource_type() == Some(ResourceType::Script)
    }

    pub fn is_stylesheet(&self) -> bool {
        self.resource_type() == Some(ResourceType::Stylesheet)
    }

    pub fn is_image(&self) -> bool {
        self.resource_type() == Some(ResourceType::Image)
    }

    pub fn from_disk_cache(&self) -> bool {
        self.record.from_disk_cache
    }

    pub fn is_non_network_protocol(&self) -> bool {
        self.record.is_non_network_protocol()
    }

    /// Served without opening a connection.
    pub fn is_connectionless(&self) -> bool {
        self.from_disk_cache() || self.is_non_network_protocol()
    }

    /// VeryHigh anything, or High scripts and documents.
    pub fn has_render_blocking_priority(&self) -> bool {
        match self.record.priority {
            ResourcePriority::VeryHigh => true,
            ResourcePriority::High => matches!(
                self.resource_type(),
                Some(ResourceType::Script) | Some(ResourceType::Document)
            ),
            _ => false,
        }
    }

    /// DNS and TCP cost nothing for this request, so a preconnect hint for
    /// its origin would not help.
    pub fn has_already_connected_to_origin(&self) -> bool {
        self.record
            .timing
            .is_some_and(|timing| timing.has_already_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceTiming;
    use rstest::rstest;

    fn node(resource_type: ResourceType, priority: ResourcePriority) -> NetworkNode {
        NetworkNode::new(NetworkRequest {
            url: "https://example.com/r".to_string(),
            resource_type: Some(resource_type),
            priority,
            ..NetworkRequest::default()
        })
    }

    #[rstest]
    #[case(ResourceType::Image, ResourcePriority::VeryHigh, true)]
    #[case(ResourceType::Script, ResourcePriority::High, true)]
    #[case(ResourceType::Document, ResourcePriority::High, true)]
    #[case(ResourceType::Stylesheet, ResourcePriority::High, false)]
    #[case(ResourceType::Script, ResourcePriority::Medium, false)]
    fn test_render_blocking_priority(
        #[case] resource_type: ResourceType,
        #[case] priority: ResourcePriority,
        #[case] expected: bool,
    ) {
        assert_eq!(
            node(resource_type, priority).has_render_blocking_priority(),
            expected
        );
    }

    #[test]
    fn test_transfer_size_write_does_not_touch_shared_record() {
        let original = node(ResourceType::Script, ResourcePriority::High);
        let mut clone = original.clone();
        assert!(clone.shares_record_with(&original));

        clone.set_transfer_size(42);
        assert!(!clone.shares_record_with(&original));
        assert_eq!(clone.record().transfer_size, 42);
        assert_eq!(original.record().transfer_size, 0);
    }

    #[test]
    fn test_already_connected_requires_timing() {
        let mut without_timing = node(ResourceType::Script, ResourcePriority::Low);
        assert!(!without_timing.has_already_connected_to_origin());

        without_timing.record_mut().timing = Some(ResourceTiming {
            dns_start: 3.0,
            dns_end: 3.0,
            connect_start: 3.0,
            connect_end: 3.0,
            ..ResourceTiming::default()
        });
        assert!(without_timing.has_already_connected_to_origin());
    }
}
