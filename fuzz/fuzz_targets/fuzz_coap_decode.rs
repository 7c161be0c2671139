#![no_main]

//! Fuzz target for the CoAP codec and the TLV parser.
//!
//! Encoding a decoded message into a short buffer must fail cleanly rather than
//! write past it.

use libfuzzer_sys::fuzz_target;

use meshcop_relay::coap::CoapMessage;
use meshcop_relay::tlv::parse_tlvs;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = CoapMessage::decode(data) else {
        return;
    };
    let _ = message.uri_path();
    let _ = parse_tlvs(&message.payload);

    // Options past the header bound decode but do not encode.
    let Ok(encoded) = message.encode() else {
        return;
    };
    let mut short = vec![0u8; encoded.len() / 2];
    assert!(message.encode_into(&mut short).is_err());
});
