mod common;

mod auth;
mod channels;
mod friends_dms;
mod invites;
mod permissions;
mod reactions;
mod read_state;
mod search;
mod servers;
mod voice_admin;
