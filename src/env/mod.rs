pub mod corridor;
pub mod session;

#[cfg(test)]
pub mod scripted;
