mod api;

pub use api::{
    ControlAction, CreateCallRequest, CreatedCall, Customer, VoiceAiApi,
    VoiceAiClient,
};
