use chrono::{Local, Timelike};
use rand::seq::SliceRandom;

const ANYTIME: &[&str] = &[
    "Hello, you've reached {name}",
    "Hi, this is {name}, how can I help?",
    "Thanks for calling, {name} speaking",
];

const MORNING: &[&str] = &[
    "Good morning, you've reached {name}",
    "Morning! This is {name}",
];

const AFTERNOON: &[&str] = &["Good afternoon, this is {name}"];

const EVENING: &[&str] = &["Good evening, you've reached {name}"];

fn time_pool(hour: u32) -> &'static [&'static str] {
    match hour {
        5..=11 => MORNING,
        12..=16 => AFTERNOON,
        _ => EVENING,
    }
}

/// Pick an opening line for the AI's first turn, varied by time of day.
///
/// The `{name}` placeholder is replaced with the configured concierge name.
pub fn opening_line(name: &str) -> String {
    opening_line_for_hour(name, Local::now().hour())
}

fn opening_line_for_hour(name: &str, hour: u32) -> String {
    let time_specific = time_pool(hour);
    let mut pool: Vec<&str> = Vec::with_capacity(ANYTIME.len() + time_specific.len());
    pool.extend_from_slice(ANYTIME);
    pool.extend_from_slice(time_specific);

    let mut rng = rand::thread_rng();
    let template = pool.choose(&mut rng).unwrap_or(&ANYTIME[0]);
    template.replace("{name}", name)
}
