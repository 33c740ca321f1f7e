pub mod wamp_cra;
