pub mod animatediff;
