// fx-protocol: Effect dispatch protocol types and wire codec.
//
// Packets are UTF-8 JSON objects terminated by a single 0x00 byte. Requests
// flow sender -> receiver, responses flow receiver -> sender. Enum fields are
// encoded as pinned integers; the mapping is frozen and unit-tested in
// `codec`.

pub mod auth;
pub mod codec;
pub mod error;
pub mod request;
pub mod response;
pub mod target;
pub mod value;

pub use codec::{CodecError, PacketCodec, encode_packet};
pub use error::{UnknownOrdinal, ValidationError};
pub use request::{Request, RequestBuilder, RequestType};
pub use response::{IdType, PacketType, Response, ResponseBuilder, ResultType};
pub use target::{Source, Target};
pub use value::{ParamValue, TriState};
