mod api;

pub use api::{
    conference_twiml, select_active_call, ActiveCall, AddParticipant,
    ConferenceInfo, ConferenceRoom, Participant, TelephonyApi, TelephonyClient,
};
