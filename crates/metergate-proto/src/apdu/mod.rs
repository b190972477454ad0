//! COSEM application-layer PDU codec.
//!
//! Decodes the APDU subset the meters emit (association handshake, get/set/
//! action responses, notifications, exceptions) and encodes the outbound
//! subset (AARQ, GET.request, ACTION.request, RLRQ). Length inference is
//! exposed separately because the VW stream parser must frame raw APDUs
//! before a full decode is possible.

pub mod data;

pub use data::{CosemDateTime, DataValue, DATETIME_LEN};

use crate::{
    error::ApduError,
    obis::{ObisCode, OBIS_LEN},
};

/// APDU tag bytes.
pub mod tag {
    /// Association request.
    pub const AARQ: u8 = 0x60;
    /// Association response.
    pub const AARE: u8 = 0x61;
    /// Release request.
    pub const RLRQ: u8 = 0x62;
    /// Release response.
    pub const RLRE: u8 = 0x63;
    /// Data notification.
    pub const DATA_NOTIFICATION: u8 = 0x0F;
    /// GET request.
    pub const GET_REQUEST: u8 = 0xC0;
    /// Event notification.
    pub const EVENT_NOTIFICATION: u8 = 0xC2;
    /// ACTION request.
    pub const ACTION_REQUEST: u8 = 0xC3;
    /// GET response.
    pub const GET_RESPONSE: u8 = 0xC4;
    /// SET response.
    pub const SET_RESPONSE: u8 = 0xC5;
    /// ACTION response.
    pub const ACTION_RESPONSE: u8 = 0xC7;
    /// Exception response.
    pub const EXCEPTION: u8 = 0xD8;
}

/// Whether `byte` is a recognized APDU tag.
pub fn is_known_tag(byte: u8) -> bool {
    matches!(
        byte,
        tag::AARQ
            | tag::AARE
            | tag::RLRQ
            | tag::RLRE
            | tag::DATA_NOTIFICATION
            | tag::GET_REQUEST
            | tag::EVENT_NOTIFICATION
            | tag::ACTION_REQUEST
            | tag::GET_RESPONSE
            | tag::SET_RESPONSE
            | tag::ACTION_RESPONSE
            | tag::EXCEPTION
    )
}

/// Result branch of a GET.response.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    /// Successful read carrying the value.
    Data(DataValue),
    /// Server-side access failure with the data-access-result code.
    Error(u8),
}

/// A decoded application PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    /// Association request (raw BER content, produced by [`encode_aarq`]).
    Aarq {
        /// BER content bytes after tag and length.
        content: Vec<u8>,
    },
    /// Association response.
    Aare {
        /// Whether the association was accepted (result == 0).
        accepted: bool,
        /// Raw association-result value.
        result: u8,
    },
    /// Release request.
    Rlrq,
    /// Release response.
    Rlre,
    /// GET.request-normal (13 bytes).
    GetRequest {
        /// Correlation id.
        invoke_id: u8,
        /// COSEM interface class.
        class_id: u16,
        /// Object address.
        obis: ObisCode,
        /// Attribute index.
        attribute: u8,
    },
    /// ACTION.request-normal (13 bytes).
    ActionRequest {
        /// Correlation id.
        invoke_id: u8,
        /// COSEM interface class.
        class_id: u16,
        /// Object address.
        obis: ObisCode,
        /// Method index.
        method: u8,
    },
    /// GET.response-normal.
    GetResponse {
        /// Correlation id.
        invoke_id: u8,
        /// Data or access error.
        result: GetResult,
    },
    /// SET.response-normal (4 bytes).
    SetResponse {
        /// Correlation id.
        invoke_id: u8,
        /// data-access-result code (0 = success).
        result: u8,
    },
    /// ACTION.response-normal.
    ActionResponse {
        /// Correlation id.
        invoke_id: u8,
        /// action-result code (0 = success).
        result: u8,
        /// Optional return value on success.
        data: Option<DataValue>,
    },
    /// Unsolicited data notification.
    DataNotification {
        /// Long invoke id (4 bytes).
        long_invoke_id: u32,
        /// Optional embedded timestamp.
        datetime: Option<CosemDateTime>,
        /// Notification body.
        value: DataValue,
    },
    /// Unsolicited event notification.
    EventNotification {
        /// Optional embedded timestamp.
        datetime: Option<CosemDateTime>,
        /// COSEM interface class.
        class_id: u16,
        /// Object address.
        obis: ObisCode,
        /// Attribute index.
        attribute: u8,
        /// Primary value.
        value: DataValue,
        /// Trailing values, if the meter appended any.
        extras: Vec<DataValue>,
    },
    /// Exception response (3 bytes).
    Exception {
        /// state-error code.
        state_error: u8,
        /// service-error code.
        service_error: u8,
    },
}

impl Apdu {
    /// Tag byte for this APDU.
    pub fn tag(&self) -> u8 {
        match self {
            Apdu::Aarq { .. } => tag::AARQ,
            Apdu::Aare { .. } => tag::AARE,
            Apdu::Rlrq => tag::RLRQ,
            Apdu::Rlre => tag::RLRE,
            Apdu::GetRequest { .. } => tag::GET_REQUEST,
            Apdu::ActionRequest { .. } => tag::ACTION_REQUEST,
            Apdu::GetResponse { .. } => tag::GET_RESPONSE,
            Apdu::SetResponse { .. } => tag::SET_RESPONSE,
            Apdu::ActionResponse { .. } => tag::ACTION_RESPONSE,
            Apdu::DataNotification { .. } => tag::DATA_NOTIFICATION,
            Apdu::EventNotification { .. } => tag::EVENT_NOTIFICATION,
            Apdu::Exception { .. } => tag::EXCEPTION,
        }
    }

    /// Decode one APDU from the start of `buf`, returning it and the bytes
    /// consumed.
    pub fn decode(buf: &[u8]) -> Result<(Apdu, usize), ApduError> {
        let Some(&first) = buf.first() else {
            return Err(ApduError::Truncated { needed: 1, available: 0 });
        };
        match first {
            tag::AARQ => {
                let (content, total) = ber_content(buf)?;
                Ok((Apdu::Aarq { content: content.to_vec() }, total))
            },
            tag::AARE => {
                let (content, total) = ber_content(buf)?;
                let result = aare_result(content);
                Ok((Apdu::Aare { accepted: result == 0, result }, total))
            },
            tag::RLRQ => {
                let (_, total) = ber_content(buf)?;
                Ok((Apdu::Rlrq, total))
            },
            tag::RLRE => {
                let (_, total) = ber_content(buf)?;
                Ok((Apdu::Rlre, total))
            },
            tag::GET_REQUEST => {
                let b = need(buf, 13)?;
                Ok((
                    Apdu::GetRequest {
                        invoke_id: b[2],
                        class_id: u16::from_be_bytes([b[3], b[4]]),
                        obis: ObisCode::from_bytes(&b[5..11])?,
                        attribute: b[11],
                    },
                    13,
                ))
            },
            tag::ACTION_REQUEST => {
                let b = need(buf, 13)?;
                Ok((
                    Apdu::ActionRequest {
                        invoke_id: b[2],
                        class_id: u16::from_be_bytes([b[3], b[4]]),
                        obis: ObisCode::from_bytes(&b[5..11])?,
                        method: b[11],
                    },
                    13,
                ))
            },
            tag::GET_RESPONSE => {
                let b = need(buf, 4)?;
                let invoke_id = b[2];
                match b[3] {
                    0x00 => {
                        let (value, used) = DataValue::decode(&buf[4..])?;
                        Ok((
                            Apdu::GetResponse { invoke_id, result: GetResult::Data(value) },
                            4 + used,
                        ))
                    },
                    0x01 => {
                        let b = need(buf, 5)?;
                        Ok((
                            Apdu::GetResponse { invoke_id, result: GetResult::Error(b[4]) },
                            5,
                        ))
                    },
                    other => {
                        Err(ApduError::InvalidSelector { value: other, context: "get-response" })
                    },
                }
            },
            tag::SET_RESPONSE => {
                let b = need(buf, 4)?;
                Ok((Apdu::SetResponse { invoke_id: b[2], result: b[3] }, 4))
            },
            tag::ACTION_RESPONSE => {
                let b = need(buf, 4)?;
                let invoke_id = b[2];
                let result = b[3];
                if result != 0 || buf.len() == 4 {
                    return Ok((Apdu::ActionResponse { invoke_id, result, data: None }, 4));
                }
                let presence = buf[4];
                if presence == 0 {
                    return Ok((Apdu::ActionResponse { invoke_id, result, data: None }, 5));
                }
                let (value, used) = DataValue::decode(&buf[5..])?;
                Ok((
                    Apdu::ActionResponse { invoke_id, result, data: Some(value) },
                    5 + used,
                ))
            },
            tag::DATA_NOTIFICATION => {
                let b = need(buf, 6)?;
                let long_invoke_id = u32::from_be_bytes([b[1], b[2], b[3], b[4]]);
                let dt_len = b[5] as usize;
                let body_at = 6 + dt_len;
                let b = need(buf, body_at)?;
                let datetime = if dt_len == DATETIME_LEN {
                    Some(CosemDateTime::from_bytes(&b[6..6 + DATETIME_LEN])?)
                } else {
                    None
                };
                let (value, used) = DataValue::decode(&buf[body_at..])?;
                Ok((
                    Apdu::DataNotification { long_invoke_id, datetime, value },
                    body_at + used,
                ))
            },
            tag::EVENT_NOTIFICATION => decode_event_notification(buf),
            tag::EXCEPTION => {
                let b = need(buf, 3)?;
                Ok((Apdu::Exception { state_error: b[1], service_error: b[2] }, 3))
            },
            other => Err(ApduError::UnknownTag { tag: other }),
        }
    }
}

/// Infer the total wire length of the APDU starting at `buf[0]`.
///
/// `Ok(Some(n))` when the APDU spans exactly `n` bytes; `Ok(None)` when more
/// bytes are needed to decide; `Err` when the prefix cannot be a valid APDU.
pub fn infer_length(buf: &[u8]) -> Result<Option<usize>, ApduError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let wait = |e: ApduError| match e {
        ApduError::Truncated { .. } => Ok(None),
        other => Err(other),
    };
    match first {
        tag::AARQ | tag::AARE | tag::RLRQ | tag::RLRE => {
            match data::parse_length(&buf[1..]) {
                Ok((len, used)) => Ok(Some(1 + used + len)),
                Err(e) => wait(e),
            }
        },
        tag::EXCEPTION => Ok(Some(3)),
        tag::GET_REQUEST | tag::ACTION_REQUEST => Ok(Some(13)),
        tag::SET_RESPONSE => Ok(Some(4)),
        tag::GET_RESPONSE => {
            if buf.len() < 4 {
                return Ok(None);
            }
            match buf[3] {
                0x00 => match DataValue::decode(&buf[4..]) {
                    Ok((_, used)) => Ok(Some(4 + used)),
                    Err(e) => wait(e),
                },
                0x01 => Ok(if buf.len() < 5 { None } else { Some(5) }),
                other => Err(ApduError::InvalidSelector { value: other, context: "get-response" }),
            }
        },
        tag::ACTION_RESPONSE => {
            if buf.len() < 4 {
                return Ok(None);
            }
            if buf[3] != 0 || buf.len() == 4 {
                return Ok(Some(4));
            }
            if buf[4] == 0 {
                return Ok(Some(5));
            }
            match DataValue::decode(&buf[5..]) {
                Ok((_, used)) => Ok(Some(5 + used)),
                Err(e) => wait(e),
            }
        },
        tag::DATA_NOTIFICATION => {
            if buf.len() < 6 {
                return Ok(None);
            }
            let body_at = 6 + buf[5] as usize;
            if buf.len() < body_at {
                return Ok(None);
            }
            match DataValue::decode(&buf[body_at..]) {
                Ok((_, used)) => Ok(Some(body_at + used)),
                Err(e) => wait(e),
            }
        },
        tag::EVENT_NOTIFICATION => match decode_event_notification(buf) {
            Ok((_, used)) => Ok(Some(used)),
            Err(e) => wait(e),
        },
        other => Err(ApduError::UnknownTag { tag: other }),
    }
}

/// Encode the public-client AARQ: logical-name referencing, no ciphering,
/// minimal conformance, proposed max PDU size 0xFFFF.
pub fn encode_aarq() -> Vec<u8> {
    const APPLICATION_CONTEXT_LN: [u8; 7] = [0x60, 0x85, 0x74, 0x05, 0x08, 0x01, 0x01];
    const INITIATE_REQUEST: [u8; 14] = [
        0x01, // initiateRequest
        0x00, // dedicated-key absent
        0x00, // response-allowed default
        0x00, // proposed-quality absent
        0x06, // DLMS version 6
        0x5F, 0x1F, 0x04, // conformance tag + length
        0x00, 0x00, 0x1E, 0x1D, // conformance block
        0xFF, 0xFF, // client-max-receive-pdu-size
    ];

    let mut out = Vec::with_capacity(31);
    out.push(tag::AARQ);
    out.push(29);
    // application-context-name
    out.push(0xA1);
    out.push(9);
    out.push(0x06);
    out.push(7);
    out.extend_from_slice(&APPLICATION_CONTEXT_LN);
    // user-information: xDLMS InitiateRequest
    out.push(0xBE);
    out.push(16);
    out.push(0x04);
    out.push(14);
    out.extend_from_slice(&INITIATE_REQUEST);
    out
}

/// Encode a GET.request-normal (13 bytes).
pub fn encode_get_request(invoke_id: u8, class_id: u16, obis: ObisCode, attribute: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(tag::GET_REQUEST);
    out.push(0x01); // get-request-normal
    out.push(invoke_id);
    out.extend_from_slice(&class_id.to_be_bytes());
    out.extend_from_slice(obis.as_bytes());
    out.push(attribute);
    out.push(0x00); // no selective access
    out
}

/// Encode an ACTION.request-normal (13 bytes).
pub fn encode_action_request(invoke_id: u8, class_id: u16, obis: ObisCode, method: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(tag::ACTION_REQUEST);
    out.push(0x01); // action-request-normal
    out.push(invoke_id);
    out.extend_from_slice(&class_id.to_be_bytes());
    out.extend_from_slice(obis.as_bytes());
    out.push(method);
    out.push(0x00); // no method parameters
    out
}

/// Encode an RLRQ with release reason "normal".
pub fn encode_rlrq() -> Vec<u8> {
    vec![tag::RLRQ, 0x03, 0x80, 0x01, 0x00]
}

/// Read a BER tag+length header and return the content slice plus total
/// bytes consumed.
fn ber_content(buf: &[u8]) -> Result<(&[u8], usize), ApduError> {
    let (len, used) = data::parse_length(&buf[1..])?;
    let start = 1 + used;
    let total = start + len;
    if buf.len() < total {
        return Err(ApduError::Truncated { needed: total, available: buf.len() });
    }
    Ok((&buf[start..total], total))
}

/// Extract the association-result integer from AARE content. Defaults to
/// "rejected-permanent" when the result element is missing.
fn aare_result(content: &[u8]) -> u8 {
    let mut at = 0;
    while at + 1 < content.len() {
        let element_tag = content[at];
        let Ok((len, used)) = data::parse_length(&content[at + 1..]) else {
            break;
        };
        let start = at + 1 + used;
        let end = start + len;
        if end > content.len() {
            break;
        }
        if element_tag == 0xA2 {
            let body = &content[start..end];
            // INTEGER wrapper: 02 01 <result>
            if body.len() >= 3 && body[0] == 0x02 {
                return body[2];
            }
        }
        at = end;
    }
    1
}

/// Decode an EventNotification, resolving the embedded-datetime ambiguity.
///
/// Both interpretations are attempted; the winner is the one whose end
/// aligns with the buffer or whose next byte is a plausible next-packet
/// marker (0x00 VW signature byte or a known APDU tag). Otherwise the
/// no-datetime reading wins.
fn decode_event_notification(buf: &[u8]) -> Result<(Apdu, usize), ApduError> {
    let with_dt = event_notification_body(buf, true);
    let without_dt = event_notification_body(buf, false);

    match (with_dt, without_dt) {
        (Ok(with), Ok(without)) => {
            let aligned = |used: usize| used == buf.len();
            let marker = |used: usize| {
                buf.get(used).is_some_and(|&b| b == 0x00 || is_known_tag(b))
            };
            let with_used = with.1;
            let without_used = without.1;
            if aligned(with_used) && !aligned(without_used) {
                Ok(with)
            } else if aligned(without_used) && !aligned(with_used) {
                Ok(without)
            } else if marker(with_used) && !marker(without_used) {
                Ok(with)
            } else {
                Ok(without)
            }
        },
        (Ok(with), Err(_)) => Ok(with),
        (Err(_), Ok(without)) => Ok(without),
        (Err(with_err), Err(without_err)) => {
            // Report the interpretation that got further; truncation beats a
            // hard failure so the stream parser keeps waiting.
            if matches!(without_err, ApduError::Truncated { .. }) {
                Err(without_err)
            } else {
                Err(with_err)
            }
        },
    }
}

/// Parse one EventNotification interpretation.
fn event_notification_body(
    buf: &[u8],
    with_datetime: bool,
) -> Result<(Apdu, usize), ApduError> {
    let mut at = 1;

    let datetime = if with_datetime {
        let b = need(buf, at + DATETIME_LEN)?;
        let dt = CosemDateTime::from_bytes(&b[at..at + DATETIME_LEN])?;
        if !dt.is_plausible() {
            return Err(ApduError::InvalidSelector {
                value: b[at],
                context: "event-notification datetime",
            });
        }
        at += DATETIME_LEN;
        Some(dt)
    } else {
        None
    };

    let b = need(buf, at + 2)?;
    let class_id = u16::from_be_bytes([b[at], b[at + 1]]);
    at += 2;

    // Optional 0x06 length tag ahead of the OBIS bytes.
    if buf.get(at) == Some(&OBIS_LEN_TAG) {
        at += 1;
    }

    let b = need(buf, at + OBIS_LEN + 1)?;
    let obis = ObisCode::from_bytes(&b[at..at + OBIS_LEN])?;
    at += OBIS_LEN;
    let attribute = b[at];
    at += 1;

    let (value, used) = DataValue::decode(&buf[at..])?;
    at += used;

    // Trailing values: data tags 0x01..=0x1B are consumed; 0x00 is not (it
    // collides with the VW signature byte).
    let mut extras = Vec::new();
    while let Some(&next) = buf.get(at) {
        if !(0x01..=0x1B).contains(&next) {
            break;
        }
        match DataValue::decode(&buf[at..]) {
            Ok((extra, extra_used)) => {
                extras.push(extra);
                at += extra_used;
            },
            Err(_) => break,
        }
    }

    Ok((
        Apdu::EventNotification { datetime, class_id, obis, attribute, value, extras },
        at,
    ))
}

const OBIS_LEN_TAG: u8 = 0x06;

fn need(buf: &[u8], len: usize) -> Result<&[u8], ApduError> {
    if buf.len() < len {
        return Err(ApduError::Truncated { needed: len, available: buf.len() });
    }
    Ok(buf)
}
