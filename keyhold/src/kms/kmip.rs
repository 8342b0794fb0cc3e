//! The KMIP 1.3 subset both KMS backends speak: Create, Get and Destroy of
//! a 256-bit AES symmetric key, one request and one response per TCP
//! connection. Messages are built and parsed here; transport lives with
//! each backend.

use crate::error::{CResult, Error};
use crate::kms::ttlv::Item;
use crate::kms::KEY_LEN;

// KMIP tag registry, the slice of it this subset touches.
pub const TAG_REQUEST_MESSAGE: u32 = 0x420078;
pub const TAG_REQUEST_HEADER: u32 = 0x420077;
pub const TAG_RESPONSE_MESSAGE: u32 = 0x42007B;
pub const TAG_RESPONSE_HEADER: u32 = 0x42007A;
pub const TAG_PROTOCOL_VERSION: u32 = 0x420069;
pub const TAG_PROTOCOL_VERSION_MAJOR: u32 = 0x42006A;
pub const TAG_PROTOCOL_VERSION_MINOR: u32 = 0x42006B;
pub const TAG_AUTHENTICATION: u32 = 0x42000C;
pub const TAG_CREDENTIAL: u32 = 0x420023;
pub const TAG_CREDENTIAL_TYPE: u32 = 0x420024;
pub const TAG_CREDENTIAL_VALUE: u32 = 0x420025;
pub const TAG_USERNAME: u32 = 0x420099;
pub const TAG_PASSWORD: u32 = 0x4200A1;
pub const TAG_BATCH_COUNT: u32 = 0x42000D;
pub const TAG_BATCH_ITEM: u32 = 0x42000F;
pub const TAG_OPERATION: u32 = 0x42005C;
pub const TAG_REQUEST_PAYLOAD: u32 = 0x420079;
pub const TAG_RESPONSE_PAYLOAD: u32 = 0x42007C;
pub const TAG_TIME_STAMP: u32 = 0x420092;
pub const TAG_RESULT_STATUS: u32 = 0x42007F;
pub const TAG_RESULT_REASON: u32 = 0x42007E;
pub const TAG_RESULT_MESSAGE: u32 = 0x42007D;
pub const TAG_OBJECT_TYPE: u32 = 0x420057;
pub const TAG_TEMPLATE_ATTRIBUTE: u32 = 0x420091;
pub const TAG_ATTRIBUTE: u32 = 0x420008;
pub const TAG_ATTRIBUTE_NAME: u32 = 0x42000A;
pub const TAG_ATTRIBUTE_VALUE: u32 = 0x42000B;
pub const TAG_NAME_VALUE: u32 = 0x420055;
pub const TAG_NAME_TYPE: u32 = 0x420054;
pub const TAG_UNIQUE_IDENTIFIER: u32 = 0x420094;
pub const TAG_SYMMETRIC_KEY: u32 = 0x42008F;
pub const TAG_KEY_BLOCK: u32 = 0x420040;
pub const TAG_KEY_FORMAT_TYPE: u32 = 0x420042;
pub const TAG_KEY_VALUE: u32 = 0x420045;
pub const TAG_KEY_MATERIAL: u32 = 0x420043;
pub const TAG_CRYPTO_ALGORITHM: u32 = 0x420028;
pub const TAG_CRYPTO_LENGTH: u32 = 0x42002A;
pub const TAG_CRYPTO_USAGE_MASK: u32 = 0x42002C;

pub const PROTOCOL_MAJOR: i32 = 1;
pub const PROTOCOL_MINOR: i32 = 3;

const CREDENTIAL_USERNAME_PASSWORD: u32 = 1;
const OBJECT_TYPE_SYMMETRIC_KEY: u32 = 2;
const ALGORITHM_AES: u32 = 3;
const KEY_FORMAT_RAW: u32 = 1;
const USAGE_ENCRYPT_DECRYPT: i32 = 0x04 | 0x08;

const RESULT_STATUS_SUCCESS: u32 = 0;
const RESULT_STATUS_FAILED: u32 = 1;
const REASON_ITEM_NOT_FOUND: u32 = 1;
const REASON_AUTH_FAILED: u32 = 3;
const REASON_GENERAL_FAILURE: u32 = 0x100;

/// The operations this subset supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Get,
    Destroy,
}

impl Operation {
    fn code(self) -> u32 {
        match self {
            Operation::Create => 0x01,
            Operation::Get => 0x0A,
            Operation::Destroy => 0x14,
        }
    }

    fn from_code(code: u32) -> CResult<Self> {
        match code {
            0x01 => Ok(Operation::Create),
            0x0A => Ok(Operation::Get),
            0x14 => Ok(Operation::Destroy),
            other => Err(Error::Protocol(format!("unsupported KMIP operation {:#04x}", other))),
        }
    }
}

/// A parsed request: credential, operation, and the one payload field the
/// operation uses (a key label for Create, a handle for Get/Destroy).
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub username: String,
    pub password: String,
    pub operation: Operation,
    pub label: Option<String>,
    pub unique_id: Option<String>,
}

/// A parsed response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub operation: Operation,
    pub unique_id: Option<String>,
    pub key_material: Option<Vec<u8>>,
}

fn request_header(username: &str, password: &str) -> Item {
    Item::structure(
        TAG_REQUEST_HEADER,
        vec![
            Item::structure(
                TAG_PROTOCOL_VERSION,
                vec![
                    Item::integer(TAG_PROTOCOL_VERSION_MAJOR, PROTOCOL_MAJOR),
                    Item::integer(TAG_PROTOCOL_VERSION_MINOR, PROTOCOL_MINOR),
                ],
            ),
            Item::structure(
                TAG_AUTHENTICATION,
                vec![Item::structure(
                    TAG_CREDENTIAL,
                    vec![
                        Item::enumeration(TAG_CREDENTIAL_TYPE, CREDENTIAL_USERNAME_PASSWORD),
                        Item::structure(
                            TAG_CREDENTIAL_VALUE,
                            vec![Item::text(TAG_USERNAME, username), Item::text(TAG_PASSWORD, password)],
                        ),
                    ],
                )],
            ),
            Item::integer(TAG_BATCH_COUNT, 1),
        ],
    )
}

fn attribute(name: &str, value: Item) -> Item {
    Item::structure(
        TAG_ATTRIBUTE,
        vec![Item::text(TAG_ATTRIBUTE_NAME, name), Item { tag: TAG_ATTRIBUTE_VALUE, value: value.value }],
    )
}

/// Builds a Create request for a 256-bit AES key carrying the given label
/// as its Name attribute.
pub fn create_request(username: &str, password: &str, label: &str) -> Item {
    let payload = Item::structure(
        TAG_REQUEST_PAYLOAD,
        vec![
            Item::enumeration(TAG_OBJECT_TYPE, OBJECT_TYPE_SYMMETRIC_KEY),
            Item::structure(
                TAG_TEMPLATE_ATTRIBUTE,
                vec![
                    attribute("Cryptographic Algorithm", Item::enumeration(0, ALGORITHM_AES)),
                    attribute("Cryptographic Length", Item::integer(0, (KEY_LEN * 8) as i32)),
                    attribute("Cryptographic Usage Mask", Item::integer(0, USAGE_ENCRYPT_DECRYPT)),
                    attribute(
                        "Name",
                        Item::structure(
                            0,
                            vec![Item::text(TAG_NAME_VALUE, label), Item::enumeration(TAG_NAME_TYPE, 1)],
                        ),
                    ),
                ],
            ),
        ],
    );
    request_message(username, password, Operation::Create, payload)
}

/// Builds a Get request for a handle.
pub fn get_request(username: &str, password: &str, unique_id: &str) -> Item {
    let payload =
        Item::structure(TAG_REQUEST_PAYLOAD, vec![Item::text(TAG_UNIQUE_IDENTIFIER, unique_id)]);
    request_message(username, password, Operation::Get, payload)
}

/// Builds a Destroy request for a handle.
pub fn destroy_request(username: &str, password: &str, unique_id: &str) -> Item {
    let payload =
        Item::structure(TAG_REQUEST_PAYLOAD, vec![Item::text(TAG_UNIQUE_IDENTIFIER, unique_id)]);
    request_message(username, password, Operation::Destroy, payload)
}

fn request_message(username: &str, password: &str, operation: Operation, payload: Item) -> Item {
    Item::structure(
        TAG_REQUEST_MESSAGE,
        vec![
            request_header(username, password),
            Item::structure(
                TAG_BATCH_ITEM,
                vec![Item::enumeration(TAG_OPERATION, operation.code()), payload],
            ),
        ],
    )
}

/// Parses any request of the subset. Rejects other protocol versions and
/// batch counts above one.
pub fn parse_request(message: &Item) -> CResult<Request> {
    if message.tag != TAG_REQUEST_MESSAGE {
        return Err(Error::Protocol("not a KMIP request message".to_string()));
    }
    let header = message.child(TAG_REQUEST_HEADER)?;
    let version = header.child(TAG_PROTOCOL_VERSION)?;
    let major = version.child(TAG_PROTOCOL_VERSION_MAJOR)?.as_integer()?;
    if major != PROTOCOL_MAJOR {
        return Err(Error::Protocol(format!("unsupported KMIP protocol version {}", major)));
    }
    if header.child(TAG_BATCH_COUNT)?.as_integer()? != 1 {
        return Err(Error::Protocol("only single-item KMIP batches are supported".to_string()));
    }

    let credential = header
        .child(TAG_AUTHENTICATION)?
        .child(TAG_CREDENTIAL)?
        .child(TAG_CREDENTIAL_VALUE)?;
    let username = credential.child(TAG_USERNAME)?.as_text()?.to_string();
    let password = credential.child(TAG_PASSWORD)?.as_text()?.to_string();

    let batch_item = message.child(TAG_BATCH_ITEM)?;
    let operation = Operation::from_code(batch_item.child(TAG_OPERATION)?.as_enumeration()?)?;
    let payload = batch_item.child(TAG_REQUEST_PAYLOAD)?;

    let mut request =
        Request { username, password, operation, label: None, unique_id: None };
    match operation {
        Operation::Create => {
            let template = payload.child(TAG_TEMPLATE_ATTRIBUTE)?;
            for attr in template.children(TAG_ATTRIBUTE) {
                if attr.child(TAG_ATTRIBUTE_NAME)?.as_text()? == "Name" {
                    let value = attr.child(TAG_ATTRIBUTE_VALUE)?;
                    request.label = Some(value.child(TAG_NAME_VALUE)?.as_text()?.to_string());
                }
            }
            if request.label.is_none() {
                return Err(Error::Protocol("Create request lacks a Name attribute".to_string()));
            }
        }
        Operation::Get | Operation::Destroy => {
            request.unique_id =
                Some(payload.child(TAG_UNIQUE_IDENTIFIER)?.as_text()?.to_string());
        }
    }
    Ok(request)
}

fn response_header(now: i64) -> Item {
    Item::structure(
        TAG_RESPONSE_HEADER,
        vec![
            Item::structure(
                TAG_PROTOCOL_VERSION,
                vec![
                    Item::integer(TAG_PROTOCOL_VERSION_MAJOR, PROTOCOL_MAJOR),
                    Item::integer(TAG_PROTOCOL_VERSION_MINOR, PROTOCOL_MINOR),
                ],
            ),
            Item::date_time(TAG_TIME_STAMP, now),
            Item::integer(TAG_BATCH_COUNT, 1),
        ],
    )
}

/// Builds the success response for an operation. Create and Destroy carry
/// the handle; Get additionally carries the wrapped key block.
pub fn success_response(
    operation: Operation,
    unique_id: &str,
    key_material: Option<&[u8]>,
    now: i64,
) -> Item {
    let mut payload = vec![];
    match operation {
        Operation::Create => {
            payload.push(Item::enumeration(TAG_OBJECT_TYPE, OBJECT_TYPE_SYMMETRIC_KEY));
            payload.push(Item::text(TAG_UNIQUE_IDENTIFIER, unique_id));
        }
        Operation::Get => {
            payload.push(Item::enumeration(TAG_OBJECT_TYPE, OBJECT_TYPE_SYMMETRIC_KEY));
            payload.push(Item::text(TAG_UNIQUE_IDENTIFIER, unique_id));
            payload.push(Item::structure(
                TAG_SYMMETRIC_KEY,
                vec![Item::structure(
                    TAG_KEY_BLOCK,
                    vec![
                        Item::enumeration(TAG_KEY_FORMAT_TYPE, KEY_FORMAT_RAW),
                        Item::structure(
                            TAG_KEY_VALUE,
                            vec![Item::bytes(
                                TAG_KEY_MATERIAL,
                                key_material.unwrap_or_default().to_vec(),
                            )],
                        ),
                        Item::enumeration(TAG_CRYPTO_ALGORITHM, ALGORITHM_AES),
                        Item::integer(TAG_CRYPTO_LENGTH, (KEY_LEN * 8) as i32),
                    ],
                )],
            ));
        }
        Operation::Destroy => {
            payload.push(Item::text(TAG_UNIQUE_IDENTIFIER, unique_id));
        }
    }
    Item::structure(
        TAG_RESPONSE_MESSAGE,
        vec![
            response_header(now),
            Item::structure(
                TAG_BATCH_ITEM,
                vec![
                    Item::enumeration(TAG_OPERATION, operation.code()),
                    Item::enumeration(TAG_RESULT_STATUS, RESULT_STATUS_SUCCESS),
                    Item::structure(TAG_RESPONSE_PAYLOAD, payload),
                ],
            ),
        ],
    )
}

/// Builds a failure response carrying the mapped reason and message.
pub fn failure_response(operation: Operation, err: &Error, now: i64) -> Item {
    let reason = match err {
        Error::NotFound(_) => REASON_ITEM_NOT_FOUND,
        Error::Auth => REASON_AUTH_FAILED,
        _ => REASON_GENERAL_FAILURE,
    };
    Item::structure(
        TAG_RESPONSE_MESSAGE,
        vec![
            response_header(now),
            Item::structure(
                TAG_BATCH_ITEM,
                vec![
                    Item::enumeration(TAG_OPERATION, operation.code()),
                    Item::enumeration(TAG_RESULT_STATUS, RESULT_STATUS_FAILED),
                    Item::enumeration(TAG_RESULT_REASON, reason),
                    Item::text(TAG_RESULT_MESSAGE, &err.to_string()),
                ],
            ),
        ],
    )
}

/// Parses a response, mapping failures back onto [`Error`] values.
pub fn parse_response(message: &Item) -> CResult<Response> {
    if message.tag != TAG_RESPONSE_MESSAGE {
        return Err(Error::Protocol("not a KMIP response message".to_string()));
    }
    let batch_item = message.child(TAG_BATCH_ITEM)?;
    let operation = Operation::from_code(batch_item.child(TAG_OPERATION)?.as_enumeration()?)?;
    let status = batch_item.child(TAG_RESULT_STATUS)?.as_enumeration()?;
    if status != RESULT_STATUS_SUCCESS {
        let reason = batch_item
            .child(TAG_RESULT_REASON)
            .and_then(|item| item.as_enumeration())
            .unwrap_or(REASON_GENERAL_FAILURE);
        let text = batch_item
            .child(TAG_RESULT_MESSAGE)
            .and_then(|item| item.as_text().map(str::to_string))
            .unwrap_or_else(|_| "unspecified KMIP failure".to_string());
        return Err(match reason {
            REASON_ITEM_NOT_FOUND => Error::NotFound(text),
            REASON_AUTH_FAILED => Error::Auth,
            _ => Error::KmsIo(text),
        });
    }

    let payload = batch_item.child(TAG_RESPONSE_PAYLOAD)?;
    let unique_id = payload
        .child(TAG_UNIQUE_IDENTIFIER)
        .ok()
        .map(|item| item.as_text().map(str::to_string))
        .transpose()?;
    let key_material = match operation {
        Operation::Get => {
            let block = payload.child(TAG_SYMMETRIC_KEY)?.child(TAG_KEY_BLOCK)?;
            let material =
                block.child(TAG_KEY_VALUE)?.child(TAG_KEY_MATERIAL)?.as_bytes()?.to_vec();
            Some(material)
        }
        _ => None,
    };
    Ok(Response { operation, unique_id, key_material })
}
