//! A minimal leader answering the leader-facing commissioning URIs.
//!
//! Enough of the leader for a relay to be exercised end to end: petitions are always
//! accepted with a fresh commissioner session id, keep-alives are checked against it,
//! and the active and pending datasets can be read and written.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::coap::{
    CoapMessage, Code, Dispatch, Dispatcher, Request, Resource, CONTENT_FORMAT_OCTET_STREAM,
};
use crate::error::{Error, TransportError};
use crate::relay::{spawn_loop, RelayHandle};
use crate::tlv::{encode_tlvs, find, parse_tlvs, Dataset, State, Tlv, TlvType};
use crate::transport::{DatagramTransport, MAX_DATAGRAM_LEN};

pub const URI_PETITION: &str = "c/lp";
pub const URI_KEEP_ALIVE: &str = "c/la";
pub const URI_ACTIVE_GET: &str = "c/ag";
pub const URI_ACTIVE_SET: &str = "c/as";
pub const URI_PENDING_GET: &str = "c/pg";
pub const URI_PENDING_SET: &str = "c/ps";

const POLL_WAIT: Duration = Duration::from_millis(20);

/// Commissioning state the leader keeps.
#[derive(Debug, Default)]
pub struct LeaderState {
    session_id: u16,
    commissioner_id: Option<String>,
    active: Dataset,
    pending: Dataset,
    /// Encoded replies to the request being handled.
    replies: Vec<Vec<u8>>,
}

impl LeaderState {
    fn reply(&mut self, request: &Request<'_>, tlvs: &[Tlv]) {
        let mut response = CoapMessage::response_to(request.message, Code::CHANGED);
        response.set_content_format(CONTENT_FORMAT_OCTET_STREAM);
        response.payload = encode_tlvs(tlvs);
        match response.encode() {
            Ok(bytes) => self.replies.push(bytes),
            Err(e) => warn!("Leader can not encode reply to {}: {}", request.uri_path, e),
        }
    }

    fn dataset_mut(&mut self, uri: &str) -> &mut Dataset {
        if uri == URI_PENDING_SET || uri == URI_PENDING_GET {
            &mut self.pending
        } else {
            &mut self.active
        }
    }
}

fn handle_petition(request: &Request<'_>, state: &mut LeaderState) {
    if let Ok(tlvs) = parse_tlvs(&request.message.payload) {
        if let Some(id) = find(&tlvs, TlvType::COMMISSIONER_ID) {
            state.commissioner_id = Some(String::from_utf8_lossy(&id.value).into_owned());
        }
    }
    state.session_id = state.session_id.wrapping_add(1);
    info!(
        "Accept petition from {:?}, session id {}",
        state.commissioner_id, state.session_id
    );

    let session = Tlv::u16(TlvType::COMMISSIONER_SESSION_ID, state.session_id);
    state.reply(request, &[Tlv::state(State::Accept), session]);
}

fn handle_keep_alive(request: &Request<'_>, state: &mut LeaderState) {
    let verdict = match parse_tlvs(&request.message.payload) {
        Ok(tlvs) => match find(&tlvs, TlvType::COMMISSIONER_SESSION_ID).map(Tlv::as_u16) {
            None => State::Accept,
            Some(Some(id)) if id == state.session_id => State::Accept,
            Some(_) => State::Reject,
        },
        Err(_) => State::Reject,
    };
    debug!("Keep-alive: {:?}", verdict);
    state.reply(request, &[Tlv::state(verdict)]);
}

fn handle_get(request: &Request<'_>, state: &mut LeaderState) {
    let payload = &request.message.payload;
    let requested = if payload.is_empty() {
        None
    } else {
        parse_tlvs(payload)
            .ok()
            .and_then(|tlvs| find(&tlvs, TlvType::GET).map(|t| t.value.clone()))
    };

    let dataset = state.dataset_mut(request.uri_path);
    let tlvs = match requested {
        Some(types) => dataset.select(&types),
        None => dataset.tlvs().to_vec(),
    };
    debug!("Dataset get on {}: {} tlvs", request.uri_path, tlvs.len());
    state.reply(request, &tlvs);
}

fn handle_set(request: &Request<'_>, state: &mut LeaderState) {
    let verdict = match parse_tlvs(&request.message.payload) {
        Ok(tlvs) => {
            // Session and timestamp qualify the request, they are not dataset content.
            let content: Vec<Tlv> = tlvs
                .into_iter()
                .filter(|t| {
                    t.tlv_type != TlvType::COMMISSIONER_SESSION_ID
                        && t.tlv_type != TlvType::ACTIVE_TIMESTAMP
                })
                .collect();
            match state.dataset_mut(request.uri_path).set(&content) {
                Ok(()) => State::Accept,
                Err(e) => {
                    debug!("Reject dataset set on {}: {}", request.uri_path, e);
                    State::Reject
                }
            }
        }
        Err(e) => {
            debug!("Reject dataset set on {}: {}", request.uri_path, e);
            State::Reject
        }
    };
    state.reply(request, &[Tlv::state(verdict)]);
}

/// The leader responder.
pub struct Leader {
    dispatcher: Dispatcher<LeaderState>,
    state: LeaderState,
}

impl Leader {
    pub fn new() -> Result<Self, Error> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_resource(Resource::for_uri(URI_PETITION, handle_petition))?;
        dispatcher.add_resource(Resource::for_uri(URI_KEEP_ALIVE, handle_keep_alive))?;
        dispatcher.add_resource(Resource::for_uri(URI_ACTIVE_GET, handle_get))?;
        dispatcher.add_resource(Resource::for_uri(URI_PENDING_GET, handle_get))?;
        dispatcher.add_resource(Resource::for_uri(URI_ACTIVE_SET, handle_set))?;
        dispatcher.add_resource(Resource::for_uri(URI_PENDING_SET, handle_set))?;

        Ok(Leader {
            dispatcher,
            state: LeaderState::default(),
        })
    }

    /// Start from an existing active dataset.
    pub fn with_active_dataset(mut self, dataset: Dataset) -> Self {
        self.state.active = dataset;
        self
    }

    /// Handle one request, returning the encoded replies.
    pub fn handle_request(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        match self.dispatcher.receive(bytes, &mut self.state) {
            Dispatch::Handled(0) => debug!("Leader has no resource for request"),
            Dispatch::Handled(_) => {}
            Dispatch::Malformed(e) => debug!("Leader drops malformed request: {}", e),
        }
        std::mem::take(&mut self.state.replies)
    }

    /// Id handed out with the last accepted petition.
    pub fn session_id(&self) -> u16 {
        self.state.session_id
    }

    pub fn commissioner_id(&self) -> Option<&str> {
        self.state.commissioner_id.as_deref()
    }

    pub fn active_dataset(&self) -> &Dataset {
        &self.state.active
    }

    pub fn pending_dataset(&self) -> &Dataset {
        &self.state.pending
    }

    /// Receive one request from `transport` and answer it.
    pub fn serve_once<T: DatagramTransport>(
        &mut self,
        transport: &T,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<(), Error> {
        let Some((n, from)) = transport.recv_from(buf, wait)? else {
            return Ok(());
        };
        for reply in self.handle_request(&buf[..n]) {
            if let Err(e) = transport.send_to(&reply, from) {
                match e {
                    TransportError::Closed => return Err(e.into()),
                    e => warn!("Leader reply to {} failed: {}", from, e),
                }
            }
        }
        Ok(())
    }
}

/// Serve `leader` on `transport` from its own thread. Shutting down hands the leader
/// back for inspection.
pub fn spawn<T>(mut leader: Leader, transport: T) -> Result<RelayHandle<Leader>, Error>
where
    T: DatagramTransport + Send + 'static,
{
    spawn_loop("meshcop-leader", move |shutdown| {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        while !shutdown.load(Ordering::SeqCst) {
            leader.serve_once(&transport, &mut buf, POLL_WAIT)?;
        }
        Ok(leader)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::MessageType;

    fn request(uri: &str, mid: u16, payload: Vec<u8>) -> Vec<u8> {
        let mut message = CoapMessage::new(MessageType::Confirmable, Code::POST, mid);
        message.set_token(&[1, 2]).unwrap();
        message.set_uri_path(uri);
        message.set_content_format(CONTENT_FORMAT_OCTET_STREAM);
        message.payload = payload;
        message.encode().unwrap()
    }

    fn reply_tlvs(replies: &[Vec<u8>]) -> (CoapMessage, Vec<Tlv>) {
        assert_eq!(replies.len(), 1);
        let reply = CoapMessage::decode(&replies[0]).unwrap();
        let tlvs = parse_tlvs(&reply.payload).unwrap();
        (reply, tlvs)
    }

    #[test]
    fn petition_increments_session_id() {
        let mut leader = Leader::new().unwrap();
        let id = encode_tlvs(&[Tlv::new(TlvType::COMMISSIONER_ID, b"test").unwrap()]);

        let (reply, tlvs) = reply_tlvs(&leader.handle_request(&request("c/lp", 7, id.clone())));
        assert_eq!(reply.message_type, MessageType::Acknowledgement);
        assert_eq!(reply.code, Code::CHANGED);
        assert_eq!(reply.message_id, 7);
        assert_eq!(&reply.token[..], &[1, 2]);
        assert_eq!(find(&tlvs, TlvType::STATE).unwrap().as_state(), Some(State::Accept));
        assert_eq!(
            find(&tlvs, TlvType::COMMISSIONER_SESSION_ID).unwrap().as_u16(),
            Some(1)
        );
        assert_eq!(leader.commissioner_id(), Some("test"));

        leader.handle_request(&request("c/lp", 8, id));
        assert_eq!(leader.session_id(), 2);
    }

    #[test]
    fn keep_alive_checks_session_id() {
        let mut leader = Leader::new().unwrap();
        leader.handle_request(&request("c/lp", 1, vec![]));

        let good = encode_tlvs(&[Tlv::u16(TlvType::COMMISSIONER_SESSION_ID, 1)]);
        let (_, tlvs) = reply_tlvs(&leader.handle_request(&request("c/la", 2, good)));
        assert_eq!(tlvs, vec![Tlv::state(State::Accept)]);

        let bad = encode_tlvs(&[Tlv::u16(TlvType::COMMISSIONER_SESSION_ID, 9)]);
        let (_, tlvs) = reply_tlvs(&leader.handle_request(&request("c/la", 3, bad)));
        assert_eq!(tlvs, vec![Tlv::state(State::Reject)]);

        let (_, tlvs) = reply_tlvs(&leader.handle_request(&request("c/la", 4, vec![])));
        assert_eq!(tlvs, vec![Tlv::state(State::Accept)]);
    }

    #[test]
    fn set_then_get() {
        let mut leader = Leader::new().unwrap();
        let set = encode_tlvs(&[
            Tlv::u16(TlvType::COMMISSIONER_SESSION_ID, 1),
            Tlv::new(TlvType::ACTIVE_TIMESTAMP, &[0, 0, 0, 0, 0, 1, 0, 0]).unwrap(),
            Tlv::u16(TlvType::CHANNEL, 15),
            Tlv::new(TlvType::NETWORK_NAME, b"Test Network").unwrap(),
        ]);
        let (_, tlvs) = reply_tlvs(&leader.handle_request(&request("c/as", 1, set)));
        assert_eq!(tlvs, vec![Tlv::state(State::Accept)]);
        assert_eq!(leader.active_dataset().tlvs().len(), 2);
        assert!(leader.pending_dataset().tlvs().is_empty());

        // whole dataset
        let (_, tlvs) = reply_tlvs(&leader.handle_request(&request("c/ag", 2, vec![])));
        assert_eq!(tlvs, leader.active_dataset().tlvs().to_vec());

        // selected types
        let get = encode_tlvs(&[Tlv::new(TlvType::GET, &[TlvType::NETWORK_NAME.0]).unwrap()]);
        let (_, tlvs) = reply_tlvs(&leader.handle_request(&request("c/ag", 3, get)));
        assert_eq!(tlvs, vec![Tlv::new(TlvType::NETWORK_NAME, b"Test Network").unwrap()]);
    }

    #[test]
    fn oversized_set_is_rejected() {
        let mut leader = Leader::new().unwrap();
        let big = encode_tlvs(&[
            Tlv::new(TlvType(40), &[0; 200]).unwrap(),
            Tlv::new(TlvType(41), &[0; 100]).unwrap(),
        ]);
        let (_, tlvs) = reply_tlvs(&leader.handle_request(&request("c/ps", 1, big)));
        assert_eq!(tlvs, vec![Tlv::state(State::Reject)]);
        assert!(leader.pending_dataset().tlvs().is_empty());
    }

    #[test]
    fn unknown_and_malformed_requests_get_no_reply() {
        let mut leader = Leader::new().unwrap();
        assert!(leader.handle_request(&request("c/zz", 1, vec![])).is_empty());
        assert!(leader.handle_request(&[0xff]).is_empty());
    }
}
