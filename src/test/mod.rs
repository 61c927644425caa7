mod buffer_lifecycle;
mod sim_time;
mod simulator;
