use wulpus_proto::{Command, CommandHeader, HEADER_LEN, MAGIC};

#[test]
fn header_roundtrip_preserves_fields() {
    let header = CommandHeader::new(Command::GetData, 804);
    let decoded = CommandHeader::decode(&header.encode()).expect("decode");
    assert_eq!(decoded, header);
    assert_eq!(decoded.command(), Some(Command::GetData));
}

#[test]
fn raw_header_keeps_unknown_command() {
    let mut raw = [0u8; HEADER_LEN];
    raw[..6].copy_from_slice(&MAGIC);
    raw[6] = 0x42;
    let header = CommandHeader::from_bytes(&raw);
    assert!(header.has_valid_magic());
    assert_eq!(header.command(), None);
    assert_eq!(header.echo().encode(), raw);
}

#[test]
fn pong_is_response_only() {
    assert!(Command::Pong.is_response_only());
    assert!(!Command::Ping.is_response_only());
}
