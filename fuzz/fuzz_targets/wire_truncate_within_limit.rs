#![no_main]
use libfuzzer_sys::fuzz_target;

use dns_types::protocol::serialise::UDP_MESSAGE_MAX_LEN;
use dns_types::protocol::types::Message;

fuzz_target!(|message: Message| {
    if let Ok(serialised) = message.to_octets_within(UDP_MESSAGE_MAX_LEN) {
        assert!(serialised.len() <= UDP_MESSAGE_MAX_LEN);
        let deserialised = Message::from_octets(&serialised).unwrap();
        assert_eq!(message.header.id, deserialised.header.id);
        assert_eq!(message.questions, deserialised.questions);
    }
});
