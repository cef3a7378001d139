use crate::error::EngineError;
use crate::event::{PublishRequest, PublishResponse};
use log::debug;
use std::collections::BTreeMap;

type EventCallback = Box<dyn FnMut(&[u8])>;

/// Orders accepted event batches into user callbacks by event index.
/// The publish handler only admits contiguous batches, so in practice
/// the buffer drains immediately; buffering still protects callbacks
/// from ever observing an index out of order.
#[derive(Default)]
pub struct EventSequencer {
    delivered_index: u64,
    buffered: BTreeMap<u64, Vec<Vec<u8>>>,
}

impl EventSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered_index(&self) -> u64 {
        self.delivered_index
    }

    pub fn sequence<F: FnMut(&[u8])>(
        &mut self,
        event_index: u64,
        events: Vec<Vec<u8>>,
        deliver: &mut F,
    ) {
        if event_index <= self.delivered_index {
            return;
        }
        self.buffered.insert(event_index, events);
        while let Some((&index, _)) = self.buffered.iter().next() {
            let events = self
                .buffered
                .remove(&index)
                .expect("first buffered batch present");
            for event in &events {
                deliver(event);
            }
            self.delivered_index = index;
        }
    }
}

/// Client-side endpoint for server publications.
///
/// Tracks the highest event index received for the session and answers
/// each publish request with the index the server should chain from, so
/// the server can detect losses and resend.
pub struct ClientSessionListener {
    session_id: u64,
    event_index: u64,
    sequencer: EventSequencer,
    listeners: Vec<EventCallback>,
}

impl ClientSessionListener {
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            event_index: 0,
            sequencer: EventSequencer::new(),
            listeners: Vec::new(),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    pub fn on_event(&mut self, callback: EventCallback) {
        self.listeners.push(callback);
    }

    /// Handles one publish request:
    ///
    /// 1. a request for another session is an error;
    /// 2. an index at or below the local one is a duplicate, acked
    ///    idempotently;
    /// 3. a gap in the chain is answered with the local index, which
    ///    triggers a resend from the next batch on;
    /// 4. otherwise the batch is accepted, sequenced, and acked.
    pub fn handle_publish(
        &mut self,
        request: &PublishRequest,
    ) -> Result<PublishResponse, EngineError> {
        if request.session_id != self.session_id {
            debug!(
                "event=publish_wrong_session local={} request={}",
                self.session_id, request.session_id
            );
            return Err(EngineError::UnknownSession(request.session_id));
        }

        if request.event_index <= self.event_index {
            return Ok(PublishResponse::ok(self.event_index));
        }

        if request.previous_index != self.event_index {
            debug!(
                "event=publish_chain_gap local={} previous={} event={}",
                self.event_index, request.previous_index, request.event_index
            );
            return Ok(PublishResponse::error(self.event_index));
        }

        self.event_index = request.event_index;
        let Self {
            sequencer,
            listeners,
            ..
        } = self;
        sequencer.sequence(request.event_index, request.events.clone(), &mut |event| {
            for listener in listeners.iter_mut() {
                listener(event);
            }
        });
        Ok(PublishResponse::ok(request.event_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PublishStatus;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn request(session_id: u64, previous: u64, index: u64, events: &[&str]) -> PublishRequest {
        PublishRequest {
            session_id,
            previous_index: previous,
            event_index: index,
            events: events.iter().map(|e| e.as_bytes().to_vec()).collect(),
        }
    }

    fn collector(listener: &mut ClientSessionListener) -> Rc<RefCell<Vec<String>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        listener.on_event(Box::new(move |event| {
            sink.borrow_mut()
                .push(String::from_utf8_lossy(event).into_owned());
        }));
        seen
    }

    #[test]
    fn rejects_other_sessions() {
        let mut listener = ClientSessionListener::new(1);
        let result = listener.handle_publish(&request(2, 0, 5, &["x"]));
        assert!(matches!(result, Err(EngineError::UnknownSession(2))));
    }

    #[test]
    fn duplicate_batches_ack_idempotently() {
        let mut listener = ClientSessionListener::new(1);
        let seen = collector(&mut listener);
        listener.handle_publish(&request(1, 0, 2, &["a"])).unwrap();
        let response = listener.handle_publish(&request(1, 0, 2, &["a"])).unwrap();
        assert_eq!(response.status, PublishStatus::Ok);
        assert_eq!(response.index, 2);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn chain_gap_reports_local_index() {
        let mut listener = ClientSessionListener::new(1);
        let seen = collector(&mut listener);
        listener.handle_publish(&request(1, 0, 2, &["a"])).unwrap();
        // Batch {prev=3, idx=4} arrives while the client only holds 2.
        let response = listener.handle_publish(&request(1, 3, 4, &["c"])).unwrap();
        assert_eq!(response.status, PublishStatus::Error);
        assert_eq!(response.index, 2);
        assert_eq!(*seen.borrow(), vec!["a".to_string()]);
    }

    #[test]
    fn contiguous_batches_deliver_in_index_order() {
        let mut listener = ClientSessionListener::new(1);
        let seen = collector(&mut listener);
        listener
            .handle_publish(&request(1, 0, 2, &["a1", "a2"]))
            .unwrap();
        let response = listener.handle_publish(&request(1, 2, 3, &["b"])).unwrap();
        assert_eq!(response.status, PublishStatus::Ok);
        assert_eq!(response.index, 3);
        assert_eq!(
            *seen.borrow(),
            vec!["a1".to_string(), "a2".to_string(), "b".to_string()]
        );
        assert_eq!(listener.event_index(), 3);
    }
}
