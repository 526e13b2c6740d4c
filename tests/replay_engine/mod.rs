mod determinism;
mod events;
mod helpers;
mod nondeterminism;
mod retries;
