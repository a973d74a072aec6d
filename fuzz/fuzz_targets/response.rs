#![no_main]

use eid_client::cbor;
use eid_client::definitions::messages::ResponseMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = cbor::from_slice::<ResponseMessage>(data);
});
