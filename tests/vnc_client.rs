//! VNC verification client
//!
//! Connects to a running server, authenticates with the password from
//! `GNOME_REMOTE_DESKTOP_TEST_VNC_PASSWORD`, and succeeds when the
//! advertised framebuffer has the expected 1024×768 size.
//!
//! Ignored by default; needs a reachable server:
//!
//! ```shell
//! GNOME_REMOTE_DESKTOP_TEST_VNC_PASSWORD=... \
//!     BOREAL_RDP_TEST_VNC_SERVER=127.0.0.1:5900 \
//!     cargo test --test vnc_client -- --ignored
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const EXPECTED_WIDTH: u16 = 1024;
const EXPECTED_HEIGHT: u16 = 768;

const SECURITY_TYPE_NONE: u8 = 1;
const SECURITY_TYPE_VNC_AUTH: u8 = 2;

/// RFB authentication cipher: single-block DES with mirrored key bits
///
/// The VNC authentication scheme reverses the bit order of each password
/// byte before using it as the DES key ([RFC 6143] 7.2.2 as implemented
/// by every VNC server since the original AT&T code).
mod rfb_des {
    const PC1: [u8; 56] = [
        57, 49, 41, 33, 25, 17, 9, 1, 58, 50, 42, 34, 26, 18, 10, 2, 59, 51, 43, 35, 27, 19, 11,
        3, 60, 52, 44, 36, 63, 55, 47, 39, 31, 23, 15, 7, 62, 54, 46, 38, 30, 22, 14, 6, 61, 53,
        45, 37, 29, 21, 13, 5, 28, 20, 12, 4,
    ];
    const PC2: [u8; 48] = [
        14, 17, 11, 24, 1, 5, 3, 28, 15, 6, 21, 10, 23, 19, 12, 4, 26, 8, 16, 7, 27, 20, 13, 2,
        41, 52, 31, 37, 47, 55, 30, 40, 51, 45, 33, 48, 44, 49, 39, 56, 34, 53, 46, 42, 50, 36,
        29, 32,
    ];
    const SHIFTS: [u8; 16] = [1, 1, 2, 2, 2, 2, 2, 2, 1, 2, 2, 2, 2, 2, 2, 1];
    const IP: [u8; 64] = [
        58, 50, 42, 34, 26, 18, 10, 2, 60, 52, 44, 36, 28, 20, 12, 4, 62, 54, 46, 38, 30, 22, 14,
        6, 64, 56, 48, 40, 32, 24, 16, 8, 57, 49, 41, 33, 25, 17, 9, 1, 59, 51, 43, 35, 27, 19,
        11, 3, 61, 53, 45, 37, 29, 21, 13, 5, 63, 55, 47, 39, 31, 23, 15, 7,
    ];
    const FP: [u8; 64] = [
        40, 8, 48, 16, 56, 24, 64, 32, 39, 7, 47, 15, 55, 23, 63, 31, 38, 6, 46, 14, 54, 22, 62,
        30, 37, 5, 45, 13, 53, 21, 61, 29, 36, 4, 44, 12, 52, 20, 60, 28, 35, 3, 43, 11, 51, 19,
        59, 27, 34, 2, 42, 10, 50, 18, 58, 26, 33, 1, 41, 9, 49, 17, 57, 25,
    ];
    const E: [u8; 48] = [
        32, 1, 2, 3, 4, 5, 4, 5, 6, 7, 8, 9, 8, 9, 10, 11, 12, 13, 12, 13, 14, 15, 16, 17, 16,
        17, 18, 19, 20, 21, 20, 21, 22, 23, 24, 25, 24, 25, 26, 27, 28, 29, 28, 29, 30, 31, 32, 1,
    ];
    const P: [u8; 32] = [
        16, 7, 20, 21, 29, 12, 28, 17, 1, 15, 23, 26, 5, 18, 31, 10, 2, 8, 24, 14, 32, 27, 3, 9,
        19, 13, 30, 6, 22, 11, 4, 25,
    ];
    const SBOX: [[u8; 64]; 8] = [
        [
            14, 4, 13, 1, 2, 15, 11, 8, 3, 10, 6, 12, 5, 9, 0, 7, 0, 15, 7, 4, 14, 2, 13, 1, 10,
            6, 12, 11, 9, 5, 3, 8, 4, 1, 14, 8, 13, 6, 2, 11, 15, 12, 9, 7, 3, 10, 5, 0, 15, 12,
            8, 2, 4, 9, 1, 7, 5, 11, 3, 14, 10, 0, 6, 13,
        ],
        [
            15, 1, 8, 14, 6, 11, 3, 4, 9, 7, 2, 13, 12, 0, 5, 10, 3, 13, 4, 7, 15, 2, 8, 14, 12,
            0, 1, 10, 6, 9, 11, 5, 0, 14, 7, 11, 10, 4, 13, 1, 5, 8, 12, 6, 9, 3, 2, 15, 13, 8,
            10, 1, 3, 15, 4, 2, 11, 6, 7, 12, 0, 5, 14, 9,
        ],
        [
            10, 0, 9, 14, 6, 3, 15, 5, 1, 13, 12, 7, 11, 4, 2, 8, 13, 7, 0, 9, 3, 4, 6, 10, 2, 8,
            5, 14, 12, 11, 15, 1, 13, 6, 4, 9, 8, 15, 3, 0, 11, 1, 2, 12, 5, 10, 14, 7, 1, 10,
            13, 0, 6, 9, 8, 7, 4, 15, 14, 3, 11, 5, 2, 12,
        ],
        [
            7, 13, 14, 3, 0, 6, 9, 10, 1, 2, 8, 5, 11, 12, 4, 15, 13, 8, 11, 5, 6, 15, 0, 3, 4,
            7, 2, 12, 1, 10, 14, 9, 10, 6, 9, 0, 12, 11, 7, 13, 15, 1, 3, 14, 5, 2, 8, 4, 3, 15,
            0, 6, 10, 1, 13, 8, 9, 4, 5, 11, 12, 7, 2, 14,
        ],
        [
            2, 12, 4, 1, 7, 10, 11, 6, 8, 5, 3, 15, 13, 0, 14, 9, 14, 11, 2, 12, 4, 7, 13, 1, 5,
            0, 15, 10, 3, 9, 8, 6, 4, 2, 1, 11, 10, 13, 7, 8, 15, 9, 12, 5, 6, 3, 0, 14, 11, 8,
            12, 7, 1, 14, 2, 13, 6, 15, 0, 9, 10, 4, 5, 3,
        ],
        [
            12, 1, 10, 15, 9, 2, 6, 8, 0, 13, 3, 4, 14, 7, 5, 11, 10, 15, 4, 2, 7, 12, 9, 5, 6,
            1, 13, 14, 0, 11, 3, 8, 9, 14, 15, 5, 2, 8, 12, 3, 7, 0, 4, 10, 1, 13, 11, 6, 4, 3,
            2, 12, 9, 5, 15, 10, 11, 14, 1, 7, 6, 0, 8, 13,
        ],
        [
            4, 11, 2, 14, 15, 0, 8, 13, 3, 12, 9, 7, 5, 10, 6, 1, 13, 0, 11, 7, 4, 9, 1, 10, 14,
            3, 5, 12, 2, 15, 8, 6, 1, 4, 11, 13, 12, 3, 7, 14, 10, 15, 6, 8, 0, 5, 9, 2, 6, 11,
            13, 8, 1, 4, 10, 7, 9, 5, 0, 15, 14, 2, 3, 12,
        ],
        [
            13, 2, 8, 4, 6, 15, 11, 1, 10, 9, 3, 14, 5, 0, 12, 7, 1, 15, 13, 8, 10, 3, 7, 4, 12,
            5, 6, 11, 0, 14, 9, 2, 7, 11, 4, 1, 9, 12, 14, 2, 0, 6, 10, 13, 15, 3, 5, 8, 2, 1,
            14, 7, 4, 10, 8, 13, 15, 12, 9, 0, 3, 5, 6, 11,
        ],
    ];

    fn bit(data: &[u8], position: u8) -> u64 {
        let position = position - 1;
        u64::from((data[(position / 8) as usize] >> (7 - position % 8)) & 1)
    }

    fn key_schedule(key: &[u8; 8]) -> [u64; 16] {
        let mut cd: u64 = 0;
        for &position in &PC1 {
            cd = (cd << 1) | bit(key, position);
        }
        let mut c = (cd >> 28) & 0x0fff_ffff;
        let mut d = cd & 0x0fff_ffff;

        let mut subkeys = [0u64; 16];
        for (round, &shift) in SHIFTS.iter().enumerate() {
            c = ((c << shift) | (c >> (28 - shift))) & 0x0fff_ffff;
            d = ((d << shift) | (d >> (28 - shift))) & 0x0fff_ffff;
            let cd = (c << 28) | d;
            let cd_bytes = cd.to_be_bytes();
            // PC2 selects from the 56-bit register, stored right-aligned
            let mut subkey = 0u64;
            for &position in &PC2 {
                subkey = (subkey << 1) | bit(&cd_bytes[1..], position);
            }
            subkeys[round] = subkey;
        }
        subkeys
    }

    fn feistel(half: u32, subkey: u64) -> u32 {
        let half_bytes = half.to_be_bytes();
        let mut expanded = 0u64;
        for &position in &E {
            expanded = (expanded << 1) | bit(&half_bytes, position);
        }
        expanded ^= subkey;

        let mut output = 0u32;
        for (box_index, sbox) in SBOX.iter().enumerate() {
            let chunk = ((expanded >> (42 - 6 * box_index)) & 0x3f) as u8;
            let row = ((chunk & 0x20) >> 4) | (chunk & 1);
            let column = (chunk >> 1) & 0xf;
            output = (output << 4) | u32::from(sbox[(row * 16 + column) as usize]);
        }

        let output_bytes = output.to_be_bytes();
        let mut permuted = 0u32;
        for &position in &P {
            permuted = (permuted << 1) | bit(&output_bytes, position) as u32;
        }
        permuted
    }

    /// Encrypt one 8-byte block with the RFB-mirrored password key
    pub fn encrypt_block(password: &[u8], block: &[u8; 8]) -> [u8; 8] {
        let mut key = [0u8; 8];
        for (i, slot) in key.iter_mut().enumerate() {
            let byte = password.get(i).copied().unwrap_or(0);
            *slot = byte.reverse_bits();
        }
        let subkeys = key_schedule(&key);

        let mut permuted = 0u64;
        for &position in &IP {
            permuted = (permuted << 1) | bit(block, position);
        }
        let mut left = (permuted >> 32) as u32;
        let mut right = permuted as u32;

        for subkey in subkeys {
            let next_right = left ^ feistel(right, subkey);
            left = right;
            right = next_right;
        }

        let preoutput = ((u64::from(right)) << 32) | u64::from(left);
        let preoutput_bytes = preoutput.to_be_bytes();
        let mut output = 0u64;
        for &position in &FP {
            output = (output << 1) | bit(&preoutput_bytes, position);
        }
        output.to_be_bytes()
    }
}

fn read_exact<const N: usize>(stream: &mut TcpStream) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

#[test]
#[ignore]
fn first_framebuffer_has_expected_size() {
    let server = std::env::var("BOREAL_RDP_TEST_VNC_SERVER")
        .unwrap_or_else(|_| "127.0.0.1:5900".to_owned());
    let password = std::env::var("GNOME_REMOTE_DESKTOP_TEST_VNC_PASSWORD")
        .expect("GNOME_REMOTE_DESKTOP_TEST_VNC_PASSWORD must be set");

    let mut stream = TcpStream::connect(&server).expect("server reachable");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // protocol version handshake
    let server_version = read_exact::<12>(&mut stream).unwrap();
    assert!(server_version.starts_with(b"RFB "), "not an RFB server");
    stream.write_all(b"RFB 003.008\n").unwrap();

    // security negotiation
    let [n_security_types] = read_exact::<1>(&mut stream).unwrap();
    assert!(n_security_types > 0, "server offered no security types");
    let mut security_types = vec![0u8; usize::from(n_security_types)];
    stream.read_exact(&mut security_types).unwrap();

    if security_types.contains(&SECURITY_TYPE_VNC_AUTH) {
        stream.write_all(&[SECURITY_TYPE_VNC_AUTH]).unwrap();

        let challenge = read_exact::<16>(&mut stream).unwrap();
        let mut response = [0u8; 16];
        for (chunk, out) in challenge.chunks_exact(8).zip(response.chunks_exact_mut(8)) {
            let block: [u8; 8] = chunk.try_into().unwrap();
            out.copy_from_slice(&rfb_des::encrypt_block(password.as_bytes(), &block));
        }
        stream.write_all(&response).unwrap();
    } else if security_types.contains(&SECURITY_TYPE_NONE) {
        stream.write_all(&[SECURITY_TYPE_NONE]).unwrap();
    } else {
        panic!("no supported security type in {security_types:?}");
    }

    let security_result = read_exact::<4>(&mut stream).unwrap();
    assert_eq!(u32::from_be_bytes(security_result), 0, "authentication failed");

    // ClientInit: non-exclusive access
    stream.write_all(&[1]).unwrap();

    // ServerInit carries the framebuffer size
    let width = u16::from_be_bytes(read_exact::<2>(&mut stream).unwrap());
    let height = u16::from_be_bytes(read_exact::<2>(&mut stream).unwrap());

    assert_eq!(width, EXPECTED_WIDTH);
    assert_eq!(height, EXPECTED_HEIGHT);

    // request one update and wait for the framebuffer-update header so
    // the size is backed by actual pixel traffic
    let mut request = Vec::with_capacity(10);
    request.push(3u8); // FramebufferUpdateRequest
    request.push(0u8); // not incremental
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&EXPECTED_WIDTH.to_be_bytes());
    request.extend_from_slice(&EXPECTED_HEIGHT.to_be_bytes());

    // skip the rest of ServerInit first: pixel format (16) + name
    let _pixel_format = read_exact::<16>(&mut stream).unwrap();
    let name_length = u32::from_be_bytes(read_exact::<4>(&mut stream).unwrap());
    let mut name = vec![0u8; name_length as usize];
    stream.read_exact(&mut name).unwrap();

    stream.write_all(&request).unwrap();

    let [message_type] = read_exact::<1>(&mut stream).unwrap();
    assert_eq!(message_type, 0, "expected a FramebufferUpdate");
}
