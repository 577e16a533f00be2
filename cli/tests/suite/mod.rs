// Aggregates all former standalone integration tests as modules.
mod child_host;
mod exit_codes;
