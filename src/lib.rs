pub mod algorithms;
pub mod config;
pub mod data;
pub mod env;
pub mod error;
pub mod models;
pub mod telemetry;

/* Asynchronous advantage actor-critic (A3C) trainer.

   Asynchronous Methods for Deep Reinforcement Learning, Mnih et al. 2016
   https://arxiv.org/abs/1602.01783

   Instruction-grounded recurrent baseline after Chaplot et al. 2017,
   https://arxiv.org/abs/1706.07230

   Workers run independently and share one lock-free parameter store; see
   algorithms::shared_store for the synchronization contract.
*/
