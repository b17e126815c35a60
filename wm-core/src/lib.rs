// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod manager;
pub mod model;
pub mod paths;
pub mod queries;
pub mod rai;
pub mod retry;
pub mod sources;
pub mod steps;
pub mod warehouse;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
test_r::enable!();
