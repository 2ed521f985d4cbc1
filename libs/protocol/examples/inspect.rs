use nabunet_protocol::{
    crc16_genibus, escape, escaped_len, write_crc, write_packet_header, FOOTER_SIZE, HEADER_SIZE,
    MSG_ESCAPE,
};

fn main() {
    // Wrap a toy payload the way the daemon wraps segment 0 of an image,
    // then show what actually hits the wire after escaping.
    let payload: Vec<u8> = (0u8..64).map(|i| i.wrapping_mul(5)).collect();

    let mut pkt = vec![0u8; HEADER_SIZE + payload.len() + FOOTER_SIZE];
    let mut i = write_packet_header(&mut pkt, 0x000001, 0, 0, true).unwrap();
    pkt[i..i + payload.len()].copy_from_slice(&payload);
    i += payload.len();
    let crc = crc16_genibus(&pkt[..i]);
    i += write_crc(&mut pkt[i..], crc).unwrap();

    println!("packet len {} crc {:04x}", i, crc);
    for (n, b) in pkt[..i].iter().enumerate() {
        print!("{:02x} ", b);
        if (n + 1) % 16 == 0 {
            println!();
        }
    }
    println!();

    let mut wire = vec![0u8; escaped_len(&pkt[..i])];
    let wire_len = escape(&pkt[..i], &mut wire).unwrap();
    println!("escaped len {}", wire_len);
    for (n, b) in pkt[..i].iter().enumerate() {
        if *b == MSG_ESCAPE {
            println!("escape byte at offset {}", n);
        }
    }
}
