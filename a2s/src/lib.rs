//! Wire format of the Source Engine server-query protocol (A2S).
//!
//! Requests and replies are fixed byte patterns; cached reply payloads are
//! treated as opaque blobs and never parsed beyond the leading marker.

/// Prefix of every single-packet datagram.
pub const SINGLE_PACKET_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
/// Prefix of the first fragment of a multi-packet reply.
pub const SPLIT_PACKET_PREFIX: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];

/// Complete A2S_INFO request without a challenge code.
pub const INFO_REQUEST: [u8; 25] = *b"\xFF\xFF\xFF\xFFTSource Engine Query\x00";
pub const PLAYER_REQUEST_HEADER: [u8; 5] = [0xFF, 0xFF, 0xFF, 0xFF, 0x55];
pub const RULES_REQUEST_HEADER: [u8; 5] = [0xFF, 0xFF, 0xFF, 0xFF, 0x56];
/// Header of the S2C_CHALLENGE packet carrying a 4-byte code.
pub const CHALLENGE_RESPONSE_HEADER: [u8; 5] = [0xFF, 0xFF, 0xFF, 0xFF, 0x41];

pub const CODE_LEN: usize = 4;
pub const INFO_CODE_POS: usize = 25;
pub const PLAYER_CODE_POS: usize = 5;
pub const RULES_CODE_POS: usize = 5;

/// Code-field values that ask for a challenge instead of presenting one.
pub const CHALLENGE_REQUEST_FF: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
pub const CHALLENGE_REQUEST_ZERO: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Info,
    Player,
    Rules,
}

impl QueryKind {
    pub const ALL: [QueryKind; 3] = [QueryKind::Info, QueryKind::Player, QueryKind::Rules];

    /// First payload byte after the single-packet prefix in this kind's reply.
    pub fn reply_type(self) -> u8 {
        match self {
            QueryKind::Info => 0x49,
            QueryKind::Player => 0x44,
            QueryKind::Rules => 0x45,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryKind::Info => "A2S_INFO",
            QueryKind::Player => "A2S_PLAYER",
            QueryKind::Rules => "A2S_RULES",
        }
    }
}

/// A client datagram accepted by the length and header checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Asks for a challenge code before the real query.
    Challenge { kind: QueryKind },
    /// Carries a previously issued challenge code.
    Query { kind: QueryKind, code: [u8; 4] },
}

/// Classifies a client datagram, returning None for anything to drop.
///
/// Only lengths of 9, 25 and 29 bytes are inspected at all:
/// A2S_PLAYER and A2S_RULES requests are 9 bytes, A2S_INFO is 25 bytes
/// bare and 29 bytes with a challenge code appended. A PLAYER or RULES
/// packet counts as a challenge request only when it is exactly one of
/// the two 9-byte request forms; any other accepted length with a
/// matching header carries its code at offset 5.
pub fn classify(payload: &[u8]) -> Option<Request> {
    let len = payload.len();
    if len != 9 && len != 25 && len != 29 {
        return None;
    }

    if payload.starts_with(&RULES_REQUEST_HEADER) {
        return Some(classify_coded(QueryKind::Rules, payload));
    }
    if payload.starts_with(&PLAYER_REQUEST_HEADER) {
        return Some(classify_coded(QueryKind::Player, payload));
    }
    if payload.starts_with(&INFO_REQUEST) {
        return match len {
            25 => Some(Request::Challenge {
                kind: QueryKind::Info,
            }),
            29 => Some(Request::Query {
                kind: QueryKind::Info,
                code: read_code(payload, INFO_CODE_POS),
            }),
            _ => None,
        };
    }

    None
}

fn classify_coded(kind: QueryKind, payload: &[u8]) -> Request {
    let code = read_code(payload, PLAYER_CODE_POS);
    if payload.len() == 9 && (code == CHALLENGE_REQUEST_FF || code == CHALLENGE_REQUEST_ZERO) {
        Request::Challenge { kind }
    } else {
        Request::Query { kind, code }
    }
}

fn read_code(payload: &[u8], pos: usize) -> [u8; 4] {
    let mut code = [0u8; 4];
    code.copy_from_slice(&payload[pos..pos + CODE_LEN]);
    code
}

/// Builds the 9-byte S2C_CHALLENGE packet carrying `code`.
pub fn challenge_response(code: [u8; 4]) -> [u8; 9] {
    let mut packet = [0u8; 9];
    packet[..5].copy_from_slice(&CHALLENGE_RESPONSE_HEADER);
    packet[5..].copy_from_slice(&code);
    packet
}

/// Extracts the code from an S2C_CHALLENGE packet, if `payload` is one.
pub fn parse_challenge_response(payload: &[u8]) -> Option<[u8; 4]> {
    if payload.len() >= 9 && payload[..5] == CHALLENGE_RESPONSE_HEADER {
        Some(read_code(payload, 5))
    } else {
        None
    }
}

/// The first packet a querying client sends for `kind`: the bare request
/// for A2S_INFO, the zeroed challenge-request form for the other two.
pub fn initial_request(kind: QueryKind) -> Vec<u8> {
    match kind {
        QueryKind::Info => INFO_REQUEST.to_vec(),
        QueryKind::Player | QueryKind::Rules => request_with_code(kind, CHALLENGE_REQUEST_ZERO),
    }
}

/// A request for `kind` presenting a challenge code.
pub fn request_with_code(kind: QueryKind, code: [u8; 4]) -> Vec<u8> {
    let mut packet = match kind {
        QueryKind::Info => {
            let mut packet = Vec::with_capacity(INFO_REQUEST.len() + CODE_LEN);
            packet.extend_from_slice(&INFO_REQUEST);
            packet
        }
        QueryKind::Player => PLAYER_REQUEST_HEADER.to_vec(),
        QueryKind::Rules => RULES_REQUEST_HEADER.to_vec(),
    };
    packet.extend_from_slice(&code);
    packet
}

/// Whether `payload` looks like a game server's reply to `kind`: either a
/// single packet of the right reply type, or the first fragment of a split
/// reply. Split replies are passed through verbatim, never reassembled.
pub fn is_expected_reply(kind: QueryKind, payload: &[u8]) -> bool {
    if payload.len() >= 4 && payload[..4] == SPLIT_PACKET_PREFIX {
        return true;
    }
    payload.len() >= 5
        && payload[..4] == SINGLE_PACKET_PREFIX
        && payload[4] == kind.reply_type()
}
