// Wire protocol for deskcast-server.
//
// Provides the media frame layout shared by server and viewer:
// - wire.rs: binary media frames (video / cursor / audio / legacy)
// - control.rs: JSON control messages (hello, request_keyframe, pointer)
// - adpcm.rs: stateless IMA-ADPCM audio codec

pub mod adpcm;
pub mod control;
pub mod wire;
